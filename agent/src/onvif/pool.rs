//! Process-wide `camera_ip → listener` map (§4.3.5). `add_camera` is
//! idempotent: a running listener is left alone, a halted one is replaced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use core_common::model::Event;

use super::listener::OnvifListener;

#[derive(Default)]
pub struct ListenerPool {
    listeners: Mutex<HashMap<String, Arc<OnvifListener>>>,
}

impl ListenerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces a halted) listener for `camera_ip`. Returns
    /// `true` if a new listener was started, `false` if one was already
    /// running (idempotent no-op).
    pub fn add_camera(
        &self,
        camera_ip: &str,
        port: u16,
        username: &str,
        password: &str,
        camera_name: &str,
        camera_id: Option<String>,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> bool {
        let mut listeners = self.listeners.lock();
        if let Some(existing) = listeners.get(camera_ip) {
            if existing.is_running() {
                return false;
            }
        }

        let listener = Arc::new(OnvifListener::new(
            camera_ip.to_string(),
            port,
            username.to_string(),
            password.to_string(),
            camera_name.to_string(),
            camera_id,
        ));
        listener.clone().start(event_tx);
        listeners.insert(camera_ip.to_string(), listener);
        true
    }

    pub fn is_listening(&self, camera_ip: &str) -> bool {
        self.listeners
            .lock()
            .get(camera_ip)
            .map(|l| l.is_running())
            .unwrap_or(false)
    }

    pub async fn remove_camera(&self, camera_ip: &str) -> bool {
        let listener = self.listeners.lock().remove(camera_ip);
        match listener {
            Some(listener) => {
                listener.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stops every listener, each with a bounded 5 s join.
    pub async fn stop_all(&self) {
        let listeners: Vec<Arc<OnvifListener>> = self.listeners.lock().drain().map(|(_, v)| v).collect();
        for listener in listeners {
            listener.stop().await;
        }
    }

    pub fn camera_ips(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_camera_is_idempotent_while_running() {
        let pool = ListenerPool::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let started_first = pool.add_camera("10.0.0.5", 80, "admin", "pw", "cam", None, tx.clone());
        assert!(started_first);
        let started_second = pool.add_camera("10.0.0.5", 80, "admin", "pw", "cam", None, tx);
        assert!(!started_second);
        pool.stop_all().await;
    }
}
