//! Signed SOAP client with auth-method discovery and caching (§4.3.1).
//!
//! Auth-method negotiation is a small per-camera state machine: start in
//! `Discovering`, move to `Established(method)` on the first success, stay
//! there. `Exhausted` means every method failed and the camera is given up
//! on for the current call chain.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use core_common::model::OnvifAuthMethod;

use crate::error::{AgentError, Result};
use crate::rtsp::digest::{build_digest_header, parse_digest_challenge};

const SOAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Discovering,
    Established(OnvifAuthMethod),
    Exhausted,
}

/// One WS-Security `UsernameToken` with `PasswordDigest`, freshly minted
/// per call (nonce + timestamp must not be reused).
struct WsSecurityToken {
    nonce_b64: String,
    created: String,
    password_digest_b64: String,
}

fn make_ws_security_token(username: &str, password: &str) -> WsSecurityToken {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();

    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();

    let _ = username;
    WsSecurityToken {
        nonce_b64: BASE64.encode(nonce),
        created,
        password_digest_b64: BASE64.encode(digest),
    }
}

fn ws_security_header(username: &str, password: &str, use_digest: bool) -> String {
    if use_digest {
        let token = make_ws_security_token(username, password);
        format!(
            r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
  <wsse:UsernameToken>
    <wsse:Username>{username}</wsse:Username>
    <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</wsse:Password>
    <wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</wsse:Nonce>
    <wsu:Created>{}</wsu:Created>
  </wsse:UsernameToken>
</wsse:Security>"#,
            token.password_digest_b64, token.nonce_b64, token.created
        )
    } else {
        format!(
            r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
  <wsse:UsernameToken>
    <wsse:Username>{username}</wsse:Username>
    <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">{password}</wsse:Password>
  </wsse:UsernameToken>
</wsse:Security>"#
        )
    }
}

fn wsa_headers(to: &str, action: &str) -> String {
    format!(
        r#"<wsa:MessageID xmlns:wsa="http://www.w3.org/2005/08/addressing">urn:uuid:{}</wsa:MessageID>
<wsa:To xmlns:wsa="http://www.w3.org/2005/08/addressing">{to}</wsa:To>
<wsa:Action xmlns:wsa="http://www.w3.org/2005/08/addressing">{action}</wsa:Action>"#,
        Uuid::new_v4()
    )
}

fn wrap_envelope(header_extra: &str, to: &str, action: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
<soap:Header>
{}
{header_extra}
</soap:Header>
<soap:Body>
{body}
</soap:Body>
</soap:Envelope>"#,
        wsa_headers(to, action)
    )
}

/// Checks whether a SOAP fault reason indicates an auth failure that
/// should trigger the next negotiation method, vs. an unrelated fault
/// that should abort.
pub fn is_auth_fault(fault_reason: &str) -> bool {
    let lower = fault_reason.to_ascii_lowercase();
    ["not authorized", "password", "authentication", "credentials", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle))
}

pub fn is_subscription_limit_fault(fault_reason: &str) -> bool {
    let lower = fault_reason.to_ascii_lowercase();
    lower.contains("limit") || lower.contains("maximum")
}

/// Extracts the reason text of a `<soap:Fault>`, if present.
pub fn extract_fault_reason(body: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(body).ok()?;
    let fault = doc.descendants().find(|n| n.tag_name().name().eq_ignore_ascii_case("Fault"))?;
    let text = fault
        .descendants()
        .find(|n| {
            let name = n.tag_name().name();
            name.eq_ignore_ascii_case("Text") || name.eq_ignore_ascii_case("Reason")
        })
        .and_then(|n| n.text())
        .unwrap_or("");
    Some(text.to_string())
}

pub struct SoapClient {
    http: reqwest::Client,
    pub service_url: String,
    pub username: String,
    pub password: String,
    pub state: AuthState,
}

impl SoapClient {
    pub fn new(service_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(SOAP_TIMEOUT).build().unwrap_or_default(),
            service_url: service_url.into(),
            username: username.into(),
            password: password.into(),
            state: AuthState::Discovering,
        }
    }

    /// Sends one SOAP call, trying auth methods in discovery order until
    /// one succeeds (or re-using the cached method once established).
    pub async fn call(&mut self, action: &str, body: &str) -> Result<String> {
        if let AuthState::Established(method) = self.state {
            return self.call_with_method(method, action, body).await;
        }
        if self.state == AuthState::Exhausted {
            return Err(AgentError::Config("auth methods exhausted".to_string()));
        }

        for &method in &OnvifAuthMethod::DISCOVERY_ORDER {
            match self.call_with_method(method, action, body).await {
                Ok(response) => {
                    self.state = AuthState::Established(method);
                    return Ok(response);
                }
                Err(AgentError::Core(core_common::CoreError::AuthFailed(_))) => continue,
                Err(other) => return Err(other),
            }
        }

        self.state = AuthState::Exhausted;
        Err(AgentError::Core(core_common::CoreError::AuthFailed(
            "all ONVIF auth methods exhausted".to_string(),
        )))
    }

    async fn call_with_method(&self, method: OnvifAuthMethod, action: &str, body: &str) -> Result<String> {
        let envelope = match method {
            OnvifAuthMethod::HttpDigest | OnvifAuthMethod::HttpDigestPlusWsSecurityDigest | OnvifAuthMethod::None => {
                let extra = if method == OnvifAuthMethod::HttpDigestPlusWsSecurityDigest {
                    ws_security_header(&self.username, &self.password, true)
                } else {
                    String::new()
                };
                wrap_envelope(&extra, &self.service_url, action, body)
            }
            OnvifAuthMethod::WsSecurityDigest => {
                let extra = ws_security_header(&self.username, &self.password, true);
                wrap_envelope(&extra, &self.service_url, action, body)
            }
            OnvifAuthMethod::WsSecurityText => {
                let extra = ws_security_header(&self.username, &self.password, false);
                wrap_envelope(&extra, &self.service_url, action, body)
            }
        };

        let needs_http_digest = matches!(
            method,
            OnvifAuthMethod::HttpDigest | OnvifAuthMethod::HttpDigestPlusWsSecurityDigest
        );

        let response_text = if needs_http_digest {
            self.post_with_http_digest(&envelope).await?
        } else {
            self.post(&envelope, None).await?
        };

        if let Some(reason) = extract_fault_reason(&response_text) {
            if is_auth_fault(&reason) {
                return Err(AgentError::Core(core_common::CoreError::AuthFailed(reason)));
            }
            return Err(AgentError::Core(core_common::CoreError::ProtocolError(reason)));
        }

        Ok(response_text)
    }

    async fn post(&self, envelope: &str, auth_header: Option<String>) -> Result<String> {
        let mut request = self
            .http
            .post(&self.service_url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope.to_string());
        if let Some(header) = auth_header {
            request = request.header("Authorization", header);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status.as_u16() == 401 {
            return Err(AgentError::Core(core_common::CoreError::AuthFailed(
                "HTTP 401".to_string(),
            )));
        }
        Ok(text)
    }

    /// Sends once unauthenticated to capture the challenge, then retries
    /// with a Digest header (the ONVIF HTTP transport layer, distinct from
    /// the WS-Security layer).
    async fn post_with_http_digest(&self, envelope: &str) -> Result<String> {
        let first = self
            .http
            .post(&self.service_url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope.to_string())
            .send()
            .await?;

        if first.status().as_u16() != 401 {
            return Ok(first.text().await?);
        }

        let www_auth = first
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let challenge = parse_digest_challenge(&www_auth).ok_or_else(|| {
            AgentError::Core(core_common::CoreError::AuthFailed("no digest challenge offered".to_string()))
        })?;

        let path = reqwest::Url::parse(&self.service_url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());
        let header = build_digest_header(&challenge, &self.username, &self.password, &path);

        self.post(envelope, Some(header)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_auth_fault_phrases() {
        assert!(is_auth_fault("Sender not Authorized"));
        assert!(is_auth_fault("Invalid password supplied"));
        assert!(!is_auth_fault("Receiver internal error"));
    }

    #[test]
    fn detects_subscription_limit_fault() {
        assert!(is_subscription_limit_fault("maximum number of subscriptions reached"));
        assert!(is_subscription_limit_fault("subscription limit exceeded"));
        assert!(!is_subscription_limit_fault("invalid filter"));
    }

    #[test]
    fn extracts_fault_reason_text() {
        let body = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
<soap:Body><soap:Fault><soap:Reason><soap:Text>Sender not Authorized</soap:Text></soap:Reason></soap:Fault></soap:Body>
</soap:Envelope>"#;
        assert_eq!(extract_fault_reason(body).as_deref(), Some("Sender not Authorized"));
    }

    #[test]
    fn discovery_order_has_five_methods_ending_in_none() {
        assert_eq!(OnvifAuthMethod::DISCOVERY_ORDER.len(), 5);
        assert_eq!(OnvifAuthMethod::DISCOVERY_ORDER[4], OnvifAuthMethod::None);
    }
}
