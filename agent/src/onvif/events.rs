//! `NotificationMessage` extraction from `PullMessages` responses (§4.3.4).

use std::collections::BTreeMap;

use chrono::Utc;
use core_common::model::{Event, EventType};

/// Parses every `NotificationMessage` in a `PullMessages` response,
/// tolerating the namespace prefix variance real firmware exhibits.
pub fn parse_notifications(body: &str, camera_ip: &str, camera_name: &str, camera_id: Option<&str>) -> Vec<Event> {
    let Ok(doc) = roxmltree::Document::parse(body) else {
        return Vec::new();
    };

    doc.descendants()
        .filter(|n| local_name_matches(n.tag_name().name(), "NotificationMessage"))
        .filter_map(|node| parse_one(node, camera_ip, camera_name, camera_id))
        .collect()
}

fn local_name_matches(name: &str, target: &str) -> bool {
    name.eq_ignore_ascii_case(target)
}

fn parse_one(
    node: roxmltree::Node,
    camera_ip: &str,
    camera_name: &str,
    camera_id: Option<&str>,
) -> Option<Event> {
    let topic = node
        .descendants()
        .find(|n| local_name_matches(n.tag_name().name(), "Topic"))
        .and_then(|n| n.text())
        .unwrap_or("")
        .trim()
        .to_string();

    let source = node
        .descendants()
        .find(|n| local_name_matches(n.tag_name().name(), "Source"))
        .into_iter()
        .flat_map(|n| n.descendants())
        .find(|n| local_name_matches(n.tag_name().name(), "SimpleItem"))
        .and_then(|n| n.attribute("Value"))
        .unwrap_or("")
        .to_string();

    let mut payload = BTreeMap::new();
    if let Some(data_node) = node
        .descendants()
        .find(|n| local_name_matches(n.tag_name().name(), "Data"))
    {
        for item in data_node
            .descendants()
            .filter(|n| local_name_matches(n.tag_name().name(), "SimpleItem"))
        {
            if let (Some(name), Some(value)) = (item.attribute("Name"), item.attribute("Value")) {
                payload.insert(name.to_string(), value.to_string());
            }
        }
    }

    if topic.is_empty() {
        return None;
    }

    let event_type = EventType::classify(&topic);
    Some(Event {
        event_type,
        topic,
        source,
        payload,
        severity: event_type.severity(),
        camera_ip: camera_ip.to_string(),
        camera_name: camera_name.to_string(),
        camera_id: camera_id.map(|s| s.to_string()),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsnt="http://docs.oasis-open.org/wsn/b-2" xmlns:tt="http://www.onvif.org/ver10/schema">
<soap:Body>
<wsnt:NotificationMessage>
  <wsnt:Topic>tns1:VideoSource/MotionAlarm</wsnt:Topic>
  <wsnt:Message>
    <tt:Message>
      <tt:Source>
        <tt:SimpleItem Name="Source" Value="VideoSourceToken1"/>
      </tt:Source>
      <tt:Data>
        <tt:SimpleItem Name="State" Value="true"/>
      </tt:Data>
    </tt:Message>
  </wsnt:Message>
</wsnt:NotificationMessage>
</soap:Body>
</soap:Envelope>"#;

    #[test]
    fn parses_topic_source_and_data() {
        let events = parse_notifications(SAMPLE, "10.0.0.5", "Front Door", None);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, EventType::MotionDetection);
        assert_eq!(event.topic, "tns1:VideoSource/MotionAlarm");
        assert_eq!(event.payload.get("State").map(String::as_str), Some("true"));
    }

    #[test]
    fn malformed_body_yields_no_events() {
        assert!(parse_notifications("not xml", "10.0.0.5", "cam", None).is_empty());
    }
}
