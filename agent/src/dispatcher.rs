//! Routes inbound commands to the relevant subsystem and enforces
//! idempotency (§4.7).

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use core_common::model::{Command, CommandType};

use crate::cloud::CloudClient;
use crate::device_store::DeviceStore;
use crate::onvif::ListenerPool;
use crate::rtsp;
use crate::scanner::{self, CancelToken, ScanEvent};
use crate::stream_store::StreamStore;

pub struct Dispatcher {
    pub cloud: std::sync::Arc<CloudClient>,
    pub devices: std::sync::Arc<DeviceStore>,
    pub streams: std::sync::Arc<StreamStore>,
    pub listeners: std::sync::Arc<ListenerPool>,
    pub event_tx: tokio::sync::mpsc::UnboundedSender<core_common::model::Event>,
    pub relay_base: String,
    pub user_id: String,
}

impl Dispatcher {
    /// Executes one command end to end: marks it executing, routes it,
    /// catches any failure as a structured result, and reports back.
    pub async fn handle(&self, mut command: Command) {
        command.status = core_common::model::CommandStatus::Executing;
        command.received_at = Some(Utc::now());
        let _ = self
            .cloud
            .command_result(&command.id, "executing", None, None)
            .await;

        let outcome = self.route(&command).await;

        match outcome {
            Ok(result) => {
                let _ = self
                    .cloud
                    .command_result(&command.id, "completed", Some(&result), None)
                    .await;
            }
            Err(message) => {
                warn!(command_id = %command.id, error = %message, "command failed");
                let _ = self
                    .cloud
                    .command_result(&command.id, "failed", None, Some(&message))
                    .await;
            }
        }
    }

    async fn route(&self, command: &Command) -> Result<serde_json::Value, String> {
        match command.command_type {
            CommandType::TestRtsp => self.test_rtsp(command).await,
            CommandType::StartStream => self.start_stream(command).await,
            CommandType::StopStream => self.stop_stream(command).await,
            CommandType::GetStatus => Ok(self.get_status()),
            CommandType::TestOnvif => self.test_onvif(command).await,
            CommandType::StartOnvifEvents => self.start_onvif_events(command).await,
            CommandType::StopOnvifEvents => self.stop_onvif_events(command).await,
            CommandType::GetOnvifStatus => Ok(self.get_onvif_status()),
            CommandType::ScanNetwork => self.scan_network(command).await,
        }
    }

    async fn test_rtsp(&self, command: &Command) -> Result<serde_json::Value, String> {
        let url = command
            .payload
            .get("rtsp_url")
            .and_then(|v| v.as_str())
            .ok_or("missing rtsp_url")?;
        let result = rtsp::probe(url, std::time::Duration::from_secs(5))
            .await
            .map_err(|e| e.to_string())?;
        Ok(serde_json::to_value(result.outcome).map_err(|e| e.to_string())?)
    }

    async fn start_stream(&self, command: &Command) -> Result<serde_json::Value, String> {
        let stream_key = command.payload.get("stream_key").and_then(|v| v.as_str()).ok_or("missing stream_key")?;
        let rtsp_url = command.payload.get("rtsp_url").and_then(|v| v.as_str()).ok_or("missing rtsp_url")?;
        let camera_name = command.payload.get("camera_name").and_then(|v| v.as_str()).unwrap_or(stream_key);

        if self.streams.is_running(stream_key) {
            return Ok(json!({ "already_running": true }));
        }
        let started = self.streams.start(stream_key, rtsp_url, camera_name, &self.relay_base);
        Ok(json!({ "already_running": !started }))
    }

    async fn stop_stream(&self, command: &Command) -> Result<serde_json::Value, String> {
        let stream_key = command.payload.get("stream_key").and_then(|v| v.as_str()).ok_or("missing stream_key")?;
        self.streams.stop(stream_key).map_err(|e| e.to_string())?;
        Ok(json!({ "stopped": true }))
    }

    fn get_status(&self) -> serde_json::Value {
        json!({ "streams": self.streams.descriptors() })
    }

    async fn test_onvif(&self, command: &Command) -> Result<serde_json::Value, String> {
        let ip = camera_ip(command)?;
        let port = camera_port(command);
        let username = command.payload.get("username").and_then(|v| v.as_str()).unwrap_or("");
        let password = command.payload.get("password").and_then(|v| v.as_str()).unwrap_or("");
        let mut client = crate::onvif::SoapClient::new(format!("http://{ip}:{port}/onvif/device_service"), username, password);
        client
            .call("GetDeviceInformation", "<GetDeviceInformation xmlns=\"http://www.onvif.org/ver10/device/wsdl\"/>")
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "reachable": true }))
    }

    async fn start_onvif_events(&self, command: &Command) -> Result<serde_json::Value, String> {
        let ip = camera_ip(command)?;
        let port = camera_port(command);
        let username = command.payload.get("username").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let password = command.payload.get("password").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let camera_name = command.payload.get("camera_name").and_then(|v| v.as_str()).unwrap_or(&ip).to_string();
        let camera_id = command.payload.get("camera_id").and_then(|v| v.as_str()).map(str::to_string);

        let started = self.listeners.add_camera(&ip, port, &username, &password, &camera_name, camera_id, self.event_tx.clone());
        Ok(json!({ "already_listening": !started }))
    }

    async fn stop_onvif_events(&self, command: &Command) -> Result<serde_json::Value, String> {
        let ip = camera_ip(command)?;
        let stopped = self.listeners.remove_camera(&ip).await;
        if stopped {
            Ok(json!({ "stopped": true }))
        } else {
            Err(format!("not found: no listener for {ip}"))
        }
    }

    fn get_onvif_status(&self) -> serde_json::Value {
        json!({ "cameras": self.listeners.camera_ips() })
    }

    async fn scan_network(&self, command: &Command) -> Result<serde_json::Value, String> {
        let cidr = command.payload.get("cidr").and_then(|v| v.as_str()).ok_or("missing cidr")?;
        let workers = command.payload.get("workers").and_then(|v| v.as_u64()).map(|w| w as usize);

        let token: CancelToken = self.devices.begin_scan(&self.user_id);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let devices = self.devices.clone();
        let user_id = self.user_id.clone();
        let cidr_owned = cidr.to_string();
        let token_for_scan = token.clone();

        tokio::spawn(async move {
            let _ = scanner::scan(&cidr_owned, workers, &user_id, token_for_scan, tx).await;
        });

        let mut emitted = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Device(record) => {
                    devices.upsert(record);
                    emitted += 1;
                }
                ScanEvent::Progress(scanner::ScanProgress::Finished { .. }) => break,
                ScanEvent::Progress(_) => {}
            }
        }
        self.devices.end_scan(&token);
        Ok(json!({ "devices_found": emitted }))
    }
}

fn camera_ip(command: &Command) -> Result<String, String> {
    command
        .payload
        .get("camera_ip")
        .or_else(|| command.payload.get("ip"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "missing camera_ip".to_string())
}

fn camera_port(command: &Command) -> u16 {
    command
        .payload
        .get("camera_port")
        .or_else(|| command.payload.get("port"))
        .and_then(|v| v.as_u64())
        .map(|p| p as u16)
        .unwrap_or(80)
}
