// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firebase Cloud Messaging push to admins when an order awaits review.
//!
//! The HTTP v1 API is used when a project id and service account are
//! configured; otherwise the legacy server-key endpoint.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use super::bus::EventSink;
use crate::domain::{OrderEvent, event_types};
use crate::error::{Error, Result};
use crate::settings::{SettingsReader, keys};
use crate::store::{PushTokenRepository, UserRepository};

pub const FCM_TIMEOUT: Duration = Duration::from_secs(8);
pub const LEGACY_BATCH_SIZE: usize = 500;
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// FCM endpoints, overridable for tests.
#[derive(Debug, Clone)]
pub struct FcmEndpoints {
    pub legacy_url: String,
    pub v1_base: String,
}

impl Default for FcmEndpoints {
    fn default() -> Self {
        Self {
            legacy_url: "https://fcm.googleapis.com/fcm/send".to_string(),
            v1_base: "https://fcm.googleapis.com".to_string(),
        }
    }
}

/// Notification content.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    account: String,
    token: String,
    expires: Instant,
}

pub struct FcmPushSink {
    settings: SettingsReader,
    users: Arc<dyn UserRepository>,
    tokens: Arc<dyn PushTokenRepository>,
    client: reqwest::Client,
    endpoints: FcmEndpoints,
    access_token: Mutex<Option<CachedToken>>,
}

impl FcmPushSink {
    pub fn new(
        settings: SettingsReader,
        users: Arc<dyn UserRepository>,
        tokens: Arc<dyn PushTokenRepository>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FCM_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            settings,
            users,
            tokens,
            client,
            endpoints: FcmEndpoints::default(),
            access_token: Mutex::new(None),
        })
    }

    pub fn with_endpoints(mut self, endpoints: FcmEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn payload(event: &OrderEvent) -> PushPayload {
        let order_no = serde_json::from_str::<Value>(&event.data_json)
            .ok()
            .and_then(|v| v.get("order_no").and_then(Value::as_str).map(str::to_string))
            .filter(|s| !s.is_empty());
        let body = match order_no {
            Some(no) => format!("Order {no}"),
            None => format!("Order #{}", event.order_id),
        };
        let mut data = BTreeMap::new();
        data.insert("order_id".to_string(), event.order_id.to_string());
        data.insert("event".to_string(), event.event_type.clone());
        PushPayload {
            title: "New order pending review".to_string(),
            body,
            data,
        }
    }

    /// Send to every token, choosing v1 or legacy from settings.
    pub async fn send(&self, tokens: &[String], payload: &PushPayload) -> Result<()> {
        let tokens: Vec<String> = tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(());
        }

        let project_id = self.settings.get_string(keys::FCM_PROJECT_ID, "").await?;
        let account_json = self
            .settings
            .get_string(keys::FCM_SERVICE_ACCOUNT_JSON, "")
            .await?;
        if !project_id.is_empty() && !account_json.is_empty() {
            let access_token = self.access_token(&account_json).await?;
            for token in &tokens {
                self.send_v1(&project_id, &access_token, token, payload)
                    .await?;
            }
            return Ok(());
        }

        let server_key = self.settings.get_string(keys::FCM_SERVER_KEY, "").await?;
        if server_key.is_empty() {
            debug!("FCM not configured, skipping push");
            return Ok(());
        }
        for batch in tokens.chunks(LEGACY_BATCH_SIZE) {
            self.send_legacy(&server_key, batch, payload).await?;
        }
        Ok(())
    }

    async fn access_token(&self, account_json: &str) -> Result<String> {
        let account: ServiceAccount = serde_json::from_str(account_json)
            .map_err(|e| Error::invalid(format!("fcm service account invalid: {e}")))?;
        {
            let cached = self.access_token.lock();
            if let Some(c) = cached.as_ref() {
                if c.account == account.client_email && c.expires > Instant::now() {
                    return Ok(c.token.clone());
                }
            }
        }

        let token_uri = if account.token_uri.is_empty() {
            DEFAULT_TOKEN_URI
        } else {
            account.token_uri.as_str()
        };
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &account.client_email,
            scope: OAUTH_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| Error::invalid(format!("fcm private key invalid: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::Internal(format!("fcm jwt signing failed: {e}")))?;

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("fcm oauth token failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Unavailable(format!(
                "fcm oauth token failed: status {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Unavailable(format!("fcm oauth token failed: {e}")))?;

        // Refresh a minute early.
        let ttl = body.expires_in.max(120) - 60;
        *self.access_token.lock() = Some(CachedToken {
            account: account.client_email,
            token: body.access_token.clone(),
            expires: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(body.access_token)
    }

    async fn send_v1(
        &self,
        project_id: &str,
        access_token: &str,
        token: &str,
        payload: &PushPayload,
    ) -> Result<()> {
        let mut message = json!({
            "token": token,
            "notification": {"title": payload.title, "body": payload.body},
        });
        if !payload.data.is_empty() {
            message["data"] = json!(payload.data);
        }
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.endpoints.v1_base.trim_end_matches('/'),
            urlencoding::encode(project_id)
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({ "message": message }))
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("fcm v1 send failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.trim().chars().take(2048).collect();
            return Err(Error::Unavailable(format!(
                "fcm v1 send failed: status {} body={body}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    async fn send_legacy(
        &self,
        server_key: &str,
        tokens: &[String],
        payload: &PushPayload,
    ) -> Result<()> {
        let mut body = json!({
            "registration_ids": tokens,
            "priority": "high",
            "notification": {"title": payload.title, "body": payload.body},
        });
        if !payload.data.is_empty() {
            body["data"] = json!(payload.data);
        }
        let resp = self
            .client
            .post(&self.endpoints.legacy_url)
            .header("Authorization", format!("key={server_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("fcm send failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Unavailable(format!(
                "fcm send failed: status {}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    fn seed_access_token(&self, account: &str, token: &str) {
        *self.access_token.lock() = Some(CachedToken {
            account: account.to_string(),
            token: token.to_string(),
            expires: Instant::now() + Duration::from_secs(600),
        });
    }
}

#[async_trait]
impl EventSink for FcmPushSink {
    fn name(&self) -> &'static str {
        "fcm_push"
    }

    async fn deliver(&self, event: &OrderEvent) -> Result<()> {
        if event.event_type != event_types::ORDER_PENDING_REVIEW {
            return Ok(());
        }
        if !self.settings.get_bool(keys::FCM_ENABLED, false).await? {
            return Ok(());
        }
        let admin_ids: Vec<i64> = self
            .users
            .list_active_admins()
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        if admin_ids.is_empty() {
            return Ok(());
        }
        let tokens: Vec<String> = self
            .tokens
            .list_push_tokens(&admin_ids)
            .await?
            .into_iter()
            .map(|t| t.token)
            .collect();
        if tokens.is_empty() {
            return Ok(());
        }
        self.send(&tokens, &Self::payload(event)).await?;
        info!(order_id = event.order_id, recipients = tokens.len(), "Review push sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PushToken, User, UserRole};
    use crate::store::MemoryStore;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Arc<MemoryStore>, FcmPushSink) {
        let store = Arc::new(MemoryStore::new());
        let admin = store
            .create_user(User::new("root", UserRole::Admin))
            .await
            .unwrap();
        let user = store
            .create_user(User::new("buyer", UserRole::User))
            .await
            .unwrap();
        for (uid, tok) in [(admin.id, "admin-token"), (user.id, "user-token")] {
            store
                .upsert_push_token(PushToken {
                    id: 0,
                    user_id: uid,
                    platform: "android".into(),
                    token: tok.into(),
                    device_id: String::new(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let settings = SettingsReader::new(store.clone());
        settings.set(keys::FCM_ENABLED, "true").await.unwrap();
        let sink = FcmPushSink::new(settings, store.clone(), store.clone())
            .unwrap()
            .with_endpoints(FcmEndpoints {
                legacy_url: format!("{}/fcm/send", server.uri()),
                v1_base: server.uri(),
            });
        (store, sink)
    }

    fn pending_review(order_id: i64) -> OrderEvent {
        OrderEvent {
            id: 1,
            order_id,
            seq: 2,
            event_type: event_types::ORDER_PENDING_REVIEW.into(),
            data_json: r#"{"order_no":"ORD-7"}"#.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_uses_order_no() {
        let p = FcmPushSink::payload(&pending_review(7));
        assert_eq!(p.title, "New order pending review");
        assert_eq!(p.body, "Order ORD-7");
        assert_eq!(p.data["order_id"], "7");
        assert_eq!(p.data["event"], "order.pending_review");
    }

    #[tokio::test]
    async fn test_legacy_push_goes_to_admin_tokens_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(header("Authorization", "key=srv"))
            .and(body_partial_json(json!({"registration_ids": ["admin-token"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (store, sink) = setup(&server).await;
        SettingsReader::new(store)
            .set(keys::FCM_SERVER_KEY, "srv")
            .await
            .unwrap();

        sink.deliver(&pending_review(7)).await.unwrap();
        // Other events are ignored.
        let mut other = pending_review(7);
        other.event_type = event_types::ORDER_PAID.into();
        sink.deliver(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_v1_push_uses_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/demo/messages:send"))
            .and(header("Authorization", "Bearer cached"))
            .and(body_partial_json(json!({"message": {"token": "admin-token"}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (store, sink) = setup(&server).await;
        let settings = SettingsReader::new(store);
        settings.set(keys::FCM_PROJECT_ID, "demo").await.unwrap();
        settings
            .set(
                keys::FCM_SERVICE_ACCOUNT_JSON,
                r#"{"client_email":"svc@demo","private_key":"unused"}"#,
            )
            .await
            .unwrap();
        sink.seed_access_token("svc@demo", "cached");

        sink.deliver(&pending_review(7)).await.unwrap();
    }

    #[tokio::test]
    async fn test_v1_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let (store, sink) = setup(&server).await;
        let settings = SettingsReader::new(store);
        settings.set(keys::FCM_PROJECT_ID, "demo").await.unwrap();
        settings
            .set(
                keys::FCM_SERVICE_ACCOUNT_JSON,
                r#"{"client_email":"svc@demo","private_key":"unused"}"#,
            )
            .await
            .unwrap();
        sink.seed_access_token("svc@demo", "cached");

        let err = sink.deliver(&pending_review(7)).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(ref m) if m.contains("boom")));
    }
}
