//! Per-camera PullPoint lifecycle: subscription creation, renewal, event
//! polling, and duplicate suppression (§4.3.2-4.3.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use core_common::model::{Event, OnvifSubscription, PullPointShape};

use super::events::parse_notifications;
use super::soap::{extract_fault_reason, is_subscription_limit_fault, SoapClient};
use crate::error::{AgentError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_BUDGET: u32 = 5;
const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
const DEDUP_WINDOW: Duration = Duration::from_millis(2000);

const SUBSCRIPTION_BODIES: [(PullPointShape, &str); 5] = [
    (
        PullPointShape::DahuaStyle,
        r#"<CreatePullPointSubscription xmlns="http://www.onvif.org/ver10/events/wsdl"><InitialTerminationTime>PT600S</InitialTerminationTime></CreatePullPointSubscription>"#,
    ),
    (
        PullPointShape::StandardOneHour,
        r#"<CreatePullPointSubscription xmlns="http://www.onvif.org/ver10/events/wsdl"><InitialTerminationTime>PT1H</InitialTerminationTime></CreatePullPointSubscription>"#,
    ),
    (
        PullPointShape::Empty,
        r#"<CreatePullPointSubscription xmlns="http://www.onvif.org/ver10/events/wsdl"/>"#,
    ),
    (
        PullPointShape::FilterSixtyMinutes,
        r#"<CreatePullPointSubscription xmlns="http://www.onvif.org/ver10/events/wsdl"><Filter/><InitialTerminationTime>PT60M</InitialTerminationTime></CreatePullPointSubscription>"#,
    ),
    (
        PullPointShape::NoPrefix,
        r#"<CreatePullPointSubscription><InitialTerminationTime>PT600S</InitialTerminationTime></CreatePullPointSubscription>"#,
    ),
];

fn pull_messages_bodies(subscription_ref: &str) -> [String; 3] {
    [
        format!(
            r#"<PullMessages xmlns="http://www.onvif.org/ver10/events/wsdl"><Timeout>PT5S</Timeout><MessageLimit>100</MessageLimit></PullMessages>"#
        ),
        format!(
            r#"<PullMessages xmlns="http://www.onvif.org/ver10/events/wsdl" xmlns:addr="{subscription_ref}"><Timeout>PT5S</Timeout><MessageLimit>100</MessageLimit></PullMessages>"#
        ),
        r#"<tev:PullMessages xmlns:tev="http://www.onvif.org/ver10/events/wsdl"><tev:Timeout>PT5S</tev:Timeout><tev:MessageLimit>100</tev:MessageLimit></tev:PullMessages>"#
            .to_string(),
    ]
}

fn extract_subscription_reference(body: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(body).ok()?;
    doc.descendants()
        .find(|n| n.tag_name().name().eq_ignore_ascii_case("Address"))
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Running,
    Stopped,
}

/// One concurrently running PullPoint poll loop for a single camera.
pub struct OnvifListener {
    subscription: Mutex<OnvifSubscription>,
    state: Mutex<ListenerState>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    camera_name: String,
    camera_id: Option<String>,
}

impl OnvifListener {
    pub fn new(
        camera_ip: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        camera_name: impl Into<String>,
        camera_id: Option<String>,
    ) -> Self {
        Self {
            subscription: Mutex::new(OnvifSubscription::new(camera_ip, port, username, password)),
            state: Mutex::new(ListenerState::Stopped),
            stop_tx: Mutex::new(None),
            camera_name: camera_name.into(),
            camera_id,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == ListenerState::Running
    }

    /// Spawns the poll loop; returns immediately. Events are pushed to
    /// `event_tx` as they're parsed and survive dedup.
    pub fn start(self: Arc<Self>, event_tx: mpsc::UnboundedSender<Event>) {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock() = Some(stop_tx);
        *self.state.lock() = ListenerState::Running;

        tokio::spawn(async move {
            let (service_url, username, password) = {
                let sub = self.subscription.lock();
                (
                    format!("http://{}:{}/onvif/Events", sub.camera_ip, sub.port),
                    sub.username.clone(),
                    sub.password.clone(),
                )
            };
            let mut client = SoapClient::new(service_url, username, password);
            let mut last_emitted: HashMap<(String, String), chrono::DateTime<Utc>> = HashMap::new();
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        info!(camera_ip = %self.subscription.lock().camera_ip, "onvif listener stopping");
                        break;
                    }
                    _ = sleep(POLL_INTERVAL) => {}
                }

                let needs_new_sub = {
                    let sub = self.subscription.lock();
                    sub.subscription_ref.is_none() || sub.needs_renewal(Utc::now())
                };

                if needs_new_sub {
                    match create_subscription(&mut client).await {
                        Ok((subscription_ref, shape)) => {
                            let mut sub = self.subscription.lock();
                            sub.subscription_ref = Some(subscription_ref);
                            sub.pull_point_shape = Some(shape);
                            sub.pull_message_shape = None;
                            sub.created_at = Utc::now();
                        }
                        Err(AgentError::Core(core_common::CoreError::SubscriptionLimit(reason))) => {
                            warn!(reason, "subscription limit reached, aborting without retry");
                            *self.state.lock() = ListenerState::Stopped;
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to create pull point subscription");
                            consecutive_failures += 1;
                        }
                    }

                    if consecutive_failures >= FAILURE_BUDGET {
                        warn!(camera_ip = %self.subscription.lock().camera_ip, "failure budget exhausted, cooling down");
                        tokio::select! {
                            _ = stop_rx.recv() => break,
                            _ = sleep(FAILURE_COOLDOWN) => {}
                        }
                        consecutive_failures = 0;
                        continue;
                    }
                }

                let subscription_ref = self.subscription.lock().subscription_ref.clone();
                let Some(subscription_ref) = subscription_ref else {
                    continue;
                };
                let cached_shape = self.subscription.lock().pull_message_shape;

                match pull_once(&mut client, &subscription_ref, cached_shape).await {
                    Ok((body, shape_index)) => {
                        consecutive_failures = 0;
                        self.subscription.lock().pull_message_shape = Some(shape_index);
                        let events = parse_notifications(
                            &body,
                            &self.subscription.lock().camera_ip,
                            &self.camera_name,
                            self.camera_id.as_deref(),
                        );
                        for event in events {
                            let key = (event.camera_ip.clone(), event.topic.clone());
                            let now = event.timestamp;
                            let is_dup = last_emitted
                                .get(&key)
                                .map(|prev| now.signed_duration_since(*prev) < chrono::Duration::from_std(DEDUP_WINDOW).unwrap())
                                .unwrap_or(false);
                            if is_dup {
                                continue;
                            }
                            last_emitted.insert(key, now);
                            let _ = event_tx.send(event);
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        if reason.contains("invalid") || reason.contains("not found") {
                            let mut sub = self.subscription.lock();
                            sub.subscription_ref = None;
                            sub.pull_message_shape = None;
                        }
                        consecutive_failures += 1;
                        if consecutive_failures >= FAILURE_BUDGET {
                            warn!(camera_ip = %self.subscription.lock().camera_ip, "failure budget exhausted, cooling down");
                            tokio::select! {
                                _ = stop_rx.recv() => break,
                                _ = sleep(FAILURE_COOLDOWN) => {}
                            }
                            consecutive_failures = 0;
                        }
                    }
                }
            }

            *self.state.lock() = ListenerState::Stopped;
        });
    }

    /// Signals the poll loop to stop and waits up to 5 s.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(()).await;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.is_running() && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn create_subscription(client: &mut SoapClient) -> Result<(String, PullPointShape)> {
    for (shape, body) in SUBSCRIPTION_BODIES {
        match client.call("CreatePullPointSubscription", body).await {
            Ok(response) => {
                if let Some(subscription_ref) = extract_subscription_reference(&response) {
                    return Ok((subscription_ref, shape));
                }
                if let Some(reason) = extract_fault_reason(&response) {
                    if is_subscription_limit_fault(&reason) {
                        return Err(AgentError::Core(core_common::CoreError::SubscriptionLimit(reason)));
                    }
                }
            }
            Err(AgentError::Core(core_common::CoreError::SubscriptionLimit(reason))) => {
                return Err(AgentError::Core(core_common::CoreError::SubscriptionLimit(reason)));
            }
            Err(_) => continue,
        }
    }
    Err(AgentError::Core(core_common::CoreError::ProtocolError(
        "no PullPoint body shape accepted by camera".to_string(),
    )))
}

/// Tries PullMessages body shapes in order, starting from `cached_shape`
/// when one is already known to work (§4.3.3: tried on first use, then
/// cached). Returns the response body and the shape index that worked.
async fn pull_once(
    client: &mut SoapClient,
    subscription_ref: &str,
    cached_shape: Option<usize>,
) -> Result<(String, usize)> {
    let bodies = pull_messages_bodies(subscription_ref);

    if let Some(index) = cached_shape {
        if let Ok(response) = client.call("PullMessages", &bodies[index]).await {
            return Ok((response, index));
        }
    }

    for (index, body) in bodies.iter().enumerate() {
        if Some(index) == cached_shape {
            continue;
        }
        if let Ok(response) = client.call("PullMessages", body).await {
            return Ok((response, index));
        }
    }
    Err(AgentError::Core(core_common::CoreError::ProtocolError(
        "no PullMessages body shape accepted".to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_subscription_reference_address() {
        let body = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://www.w3.org/2005/08/addressing">
<soap:Body><SubscriptionReference><wsa:Address>http://10.0.0.5/onvif/Subscription?Idx=0</wsa:Address></SubscriptionReference></soap:Body>
</soap:Envelope>"#;
        assert_eq!(
            extract_subscription_reference(body).as_deref(),
            Some("http://10.0.0.5/onvif/Subscription?Idx=0")
        );
    }

    #[test]
    fn subscription_body_variants_cover_five_shapes() {
        assert_eq!(SUBSCRIPTION_BODIES.len(), 5);
    }

    #[test]
    fn pull_messages_body_variants_cover_three_shapes() {
        assert_eq!(pull_messages_bodies("http://10.0.0.5/sub").len(), 3);
    }

    #[test]
    fn subscription_starts_with_no_cached_pull_shape() {
        let sub = OnvifSubscription::new("10.0.0.5", 80, "admin", "admin");
        assert_eq!(sub.pull_message_shape, None);
    }
}
