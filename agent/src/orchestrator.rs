//! Owns the lifecycle of every other component: boot, background tasks,
//! signal handling, graceful shutdown (§4.9).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cloud::{CloudClient, HeartbeatRequest};
use crate::config::AgentConfig;
use crate::device_store::DeviceStore;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::event_buffer::{run_flush_loop, EventBuffer};
use crate::onvif::ListenerPool;
use crate::stream_store::StreamStore;
use crate::transcoder;

pub struct Orchestrator {
    config: AgentConfig,
}

impl Orchestrator {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Boots H (register), then the heartbeat/monitor/event-flush
    /// background tasks, and blocks until a termination signal arrives.
    pub async fn run(self) -> Result<()> {
        let cloud = Arc::new(CloudClient::new(&self.config.cloud_url, &self.config.device_token));

        let local_ip = local_ip_best_effort();
        let hostname = hostname_best_effort();
        let os_info = std::env::consts::OS.to_string();

        let registration = cloud
            .register(&hostname, &local_ip, &os_info)
            .await
            .map_err(|e| {
                error!(error = %e, "registration failed");
                e
            })?;

        info!(agent_id = %registration.agent_id, client_id = %registration.client_id, "registered with cloud");

        let devices = Arc::new(DeviceStore::new());
        let streams = Arc::new(StreamStore::new());
        let listeners = Arc::new(ListenerPool::new());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(EventBuffer::new(flush_tx));

        let buffer_for_drain = buffer.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                buffer_for_drain.push(event);
            }
        });

        let (flush_stop_tx, flush_stop_rx) = mpsc::channel(1);
        let flush_task = tokio::spawn(run_flush_loop(buffer.clone(), cloud.clone(), flush_rx, flush_stop_rx));

        let dispatcher = Arc::new(Dispatcher {
            cloud: cloud.clone(),
            devices: devices.clone(),
            streams: streams.clone(),
            listeners: listeners.clone(),
            event_tx: event_tx.clone(),
            relay_base: self.config.relay_websocket_url.clone(),
            user_id: registration.user_id.clone(),
        });

        let ffmpeg_installed = transcoder::locate_binary().is_some();
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            cloud.clone(),
            dispatcher.clone(),
            streams.clone(),
            registration.client_id.clone(),
            local_ip.clone(),
            hostname.clone(),
            os_info.clone(),
            ffmpeg_installed,
            self.config.network_range.clone(),
            Duration::from_secs(self.config.heartbeat_interval_seconds),
        ));

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");

        heartbeat_task.abort();
        listeners.stop_all().await;
        for stream_key in streams.stream_keys() {
            let _ = streams.stop(&stream_key);
        }
        let _ = flush_stop_tx.send(()).await;
        let _ = flush_task.await;

        info!("orchestrator shutdown complete");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop(
    cloud: Arc<CloudClient>,
    dispatcher: Arc<Dispatcher>,
    streams: Arc<StreamStore>,
    client_id: String,
    local_ip: String,
    hostname: String,
    os_info: String,
    ffmpeg_installed: bool,
    network_range: Option<String>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let active_streams = streams.stream_keys();
        let req = HeartbeatRequest {
            client_id: &client_id,
            local_ip: &local_ip,
            hostname: &hostname,
            os_info: &os_info,
            ffmpeg_installed,
            active_streams,
            network_range: network_range.as_deref(),
        };

        match cloud.heartbeat(&req).await {
            Ok(mut commands) => {
                // Processed one at a time, in `created_at` order (§5).
                commands.sort_by_key(|c| c.created_at);
                for command in commands {
                    dispatcher.handle(command).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed, continuing");
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received CTRL+C"),
        Err(e) => error!(error = %e, "signal error"),
    }
}

fn local_ip_best_effort() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("1.1.1.1:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "camera-agent".to_string())
}
