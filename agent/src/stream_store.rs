//! Per-stream supervisor state: owns the transcoder process and the
//! uplink task exclusively (§3, §4.4.3, §5). Only this store may start or
//! stop a stream's tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use core_common::model::{StreamDescriptor, StreamState};

use crate::error::{AgentError, Result};
use crate::transcoder::TranscoderHandle;

struct StreamHandle {
    descriptor: Arc<Mutex<StreamDescriptor>>,
    supervisor_task: JoinHandle<()>,
}

#[derive(Default)]
pub struct StreamStore {
    streams: Mutex<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, stream_key: &str) -> bool {
        self.streams.lock().contains_key(stream_key)
    }

    /// Starts a stream's transcoder+uplink supervisor task. Idempotent:
    /// if `stream_key` already has a running supervisor, this is a no-op
    /// and the caller should report `already_running: true`.
    pub fn start(
        &self,
        stream_key: &str,
        rtsp_url: &str,
        camera_name: &str,
        relay_base: &str,
    ) -> bool {
        let mut streams = self.streams.lock();
        if streams.contains_key(stream_key) {
            return false;
        }

        let descriptor = Arc::new(Mutex::new(StreamDescriptor::new(stream_key, rtsp_url, camera_name)));
        let key = stream_key.to_string();
        let url = rtsp_url.to_string();
        let relay_base = relay_base.to_string();
        let descriptor_for_task = descriptor.clone();

        let supervisor_task = tokio::spawn(run_stream_supervisor(key, url, relay_base, descriptor_for_task));

        streams.insert(
            stream_key.to_string(),
            Arc::new(StreamHandle { descriptor, supervisor_task }),
        );
        true
    }

    /// Stops a running stream. Returns an error if `stream_key` isn't
    /// known (§4.7: `stop_stream` on a non-existent key fails).
    pub fn stop(&self, stream_key: &str) -> Result<()> {
        let handle = self.streams.lock().remove(stream_key);
        match handle {
            Some(handle) => {
                handle.supervisor_task.abort();
                Ok(())
            }
            None => Err(AgentError::Core(core_common::CoreError::NotFound(format!(
                "stream '{stream_key}' not found"
            )))),
        }
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.streams
            .lock()
            .values()
            .map(|h| h.descriptor.lock().clone())
            .collect()
    }

    pub fn stream_keys(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }
}

/// Owns one transcoder process and its uplink task for the lifetime of
/// the stream (`starting -> running -> error|stopped`, §4.4.3), mirroring
/// each transition into `descriptor` so `get_status` reflects live state.
async fn run_stream_supervisor(
    stream_key: String,
    rtsp_url: String,
    relay_base: String,
    descriptor: Arc<Mutex<StreamDescriptor>>,
) {
    let mut handle = match TranscoderHandle::spawn(&stream_key, &rtsp_url).await {
        Ok(h) => h,
        Err(e) => {
            warn!(stream_key, error = %e, "transcoder failed to start");
            let mut d = descriptor.lock();
            d.state = StreamState::Error;
            d.last_error = Some(e.to_string());
            return;
        }
    };

    let Some(stdout) = handle.take_stdout() else {
        warn!(stream_key, "transcoder produced no stdout handle");
        let mut d = descriptor.lock();
        d.state = StreamState::Error;
        d.last_error = Some("transcoder produced no stdout handle".to_string());
        return;
    };

    info!(stream_key, "stream transitioning starting -> running");
    descriptor.lock().state = StreamState::Running;
    crate::uplink::run(&relay_base, &stream_key, stdout, descriptor.clone()).await;

    match handle.try_wait() {
        Ok(Some(status)) if !status.success() => {
            warn!(stream_key, ?status, "stream transitioning running -> error");
            let mut d = descriptor.lock();
            d.state = StreamState::Error;
            d.last_error = Some(format!("transcoder exited with {status}"));
        }
        _ => {
            info!(stream_key, "stream transitioning running -> stopped");
            descriptor.lock().state = StreamState::Stopped;
        }
    }

    handle.terminate().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let store = StreamStore::new();
        let first = store.start("s1", "rtsp://x", "cam", "ws://relay");
        assert!(first);
        let second = store.start("s1", "rtsp://x", "cam", "ws://relay");
        assert!(!second);
        let _ = store.stop("s1");
    }

    #[test]
    fn stop_on_missing_key_fails() {
        let store = StreamStore::new();
        assert!(store.stop("nonexistent").is_err());
    }

    #[tokio::test]
    async fn second_stop_after_first_fails() {
        let store = StreamStore::new();
        store.start("s1", "rtsp://x", "cam", "ws://relay");
        assert!(store.stop("s1").is_ok());
        assert!(store.stop("s1").is_err());
    }
}
