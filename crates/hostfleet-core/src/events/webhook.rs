// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Robot webhooks: POST every matching order event as JSON.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::bus::EventSink;
use crate::domain::OrderEvent;
use crate::error::{Error, Result};
use crate::settings::{SettingsReader, keys, parse_bool};

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(8);

/// One configured robot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotWebhook {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub events: Vec<String>,
}

impl RobotWebhook {
    /// Empty list or `*` matches everything; `order.*` matches by prefix.
    pub fn matches_event(&self, event: &str) -> bool {
        if self.events.is_empty() {
            return true;
        }
        self.events.iter().any(|pattern| {
            let pattern = pattern.trim();
            if pattern == "*" || pattern == event {
                return true;
            }
            match pattern.strip_suffix('*') {
                Some(prefix) if prefix.ends_with('.') => event.starts_with(prefix),
                _ => false,
            }
        })
    }

    fn is_deliverable(&self, event: &str) -> bool {
        self.enabled && !self.url.trim().is_empty() && self.matches_event(event)
    }
}

/// Lowercase hex HMAC-SHA256 of `body`.
pub fn sign(body: &[u8], secret: &str) -> String {
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Serialize)]
struct Envelope<'a> {
    order_id: i64,
    seq: i64,
    event: &'a str,
    created_at: i64,
    data: Value,
    data_string: &'a str,
}

/// Delivers events to the robots configured in settings.
pub struct RobotWebhookSink {
    settings: SettingsReader,
    client: reqwest::Client,
}

impl RobotWebhookSink {
    pub fn new(settings: SettingsReader) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { settings, client })
    }

    /// `robot_webhooks`, or the single legacy `robot_webhook_url` robot.
    pub async fn load_webhooks(&self) -> Result<Vec<RobotWebhook>> {
        if let Some(hooks) = self
            .settings
            .get_json::<Vec<RobotWebhook>>(keys::ROBOT_WEBHOOKS)
            .await?
        {
            if !hooks.is_empty() {
                return Ok(hooks);
            }
        }
        let Some(url) = self.settings.get_raw(keys::ROBOT_WEBHOOK_URL).await? else {
            return Ok(Vec::new());
        };
        if let Some(enabled) = self.settings.get_raw(keys::ROBOT_WEBHOOK_ENABLED).await? {
            if parse_bool(&enabled) != Some(true) {
                return Ok(Vec::new());
            }
        }
        let secret = self
            .settings
            .get_string(keys::ROBOT_WEBHOOK_SECRET, "")
            .await?;
        Ok(vec![RobotWebhook {
            name: "default".to_string(),
            url,
            secret,
            enabled: true,
            events: Vec::new(),
        }])
    }

    fn body(event: &OrderEvent) -> Result<Vec<u8>> {
        let data = if event.data_json.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&event.data_json)?
        };
        Ok(serde_json::to_vec(&Envelope {
            order_id: event.order_id,
            seq: event.seq,
            event: &event.event_type,
            created_at: event.created_at.timestamp(),
            data,
            data_string: &event.data_json,
        })?)
    }
}

#[async_trait]
impl EventSink for RobotWebhookSink {
    fn name(&self) -> &'static str {
        "robot_webhook"
    }

    async fn deliver(&self, event: &OrderEvent) -> Result<()> {
        let hooks = self.load_webhooks().await?;
        if !hooks.iter().any(|h| h.is_deliverable(&event.event_type)) {
            return Ok(());
        }
        let body = Self::body(event)?;

        let mut last_err = None;
        for hook in hooks.iter().filter(|h| h.is_deliverable(&event.event_type)) {
            let mut req = self
                .client
                .post(hook.url.trim())
                .header("Content-Type", "application/json")
                .header("X-Event", &event.event_type)
                .body(body.clone());
            if !hook.secret.is_empty() {
                req = req.header("X-Signature", sign(&body, &hook.secret));
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(robot = %hook.name, order_id = event.order_id, seq = event.seq, "Webhook delivered");
                }
                Ok(resp) => {
                    warn!(robot = %hook.name, status = %resp.status(), "Webhook rejected");
                    last_err = Some(Error::Unavailable(format!(
                        "webhook {} returned {}",
                        hook.name,
                        resp.status()
                    )));
                }
                Err(e) => {
                    warn!(robot = %hook.name, error = %e, "Webhook request failed");
                    last_err = Some(Error::Unavailable(format!("webhook {}: {e}", hook.name)));
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(event_type: &str) -> OrderEvent {
        OrderEvent {
            id: 1,
            order_id: 42,
            seq: 2,
            event_type: event_type.into(),
            data_json: r#"{"order_no":"ORD1"}"#.into(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn hook(events: &[&str]) -> RobotWebhook {
        RobotWebhook {
            name: "r".into(),
            url: "http://x".into(),
            secret: String::new(),
            enabled: true,
            events: events.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_event_matching() {
        assert!(hook(&[]).matches_event("order.paid"));
        assert!(hook(&["*"]).matches_event("item.failed"));
        assert!(hook(&["order.*"]).matches_event("order.paid"));
        assert!(!hook(&["order.*"]).matches_event("item.failed"));
        assert!(hook(&["item.failed"]).matches_event("item.failed"));
        assert!(!hook(&["item.failed"]).matches_event("item.provisioned"));
    }

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign(b"what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_body_shape() {
        let body = RobotWebhookSink::body(&event("order.paid")).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["order_id"], 42);
        assert_eq!(v["seq"], 2);
        assert_eq!(v["created_at"], 1_700_000_000);
        assert_eq!(v["data"]["order_no"], "ORD1");
        assert_eq!(v["data_string"], r#"{"order_no":"ORD1"}"#);
    }

    #[tokio::test]
    async fn test_delivers_signed_request_to_matching_robot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Event", "order.paid"))
            .and(header_exists("X-Signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let settings = SettingsReader::new(Arc::new(MemoryStore::new()));
        let hooks = serde_json::json!([
            {"name": "ops", "url": format!("{}/hook", server.uri()), "secret": "s3", "enabled": true, "events": ["order.*"]},
            {"name": "off", "url": format!("{}/hook", server.uri()), "enabled": false},
        ]);
        settings
            .set(keys::ROBOT_WEBHOOKS, &hooks.to_string())
            .await
            .unwrap();
        let sink = RobotWebhookSink::new(settings).unwrap();

        sink.deliver(&event("order.paid")).await.unwrap();
        sink.deliver(&event("item.failed")).await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_single_url_fallback() {
        let settings = SettingsReader::new(Arc::new(MemoryStore::new()));
        settings
            .set(keys::ROBOT_WEBHOOK_URL, "http://robot.local/x")
            .await
            .unwrap();
        settings
            .set(keys::ROBOT_WEBHOOK_SECRET, "k")
            .await
            .unwrap();
        let sink = RobotWebhookSink::new(settings.clone()).unwrap();
        let hooks = sink.load_webhooks().await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name, "default");
        assert_eq!(hooks[0].secret, "k");

        settings
            .set(keys::ROBOT_WEBHOOK_ENABLED, "false")
            .await
            .unwrap();
        assert!(sink.load_webhooks().await.unwrap().is_empty());
    }
}
