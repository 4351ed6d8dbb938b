// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_core::domain::{DEFAULT_INSTANCE_ID, InstanceKey, PluginCategory};
use hostfleet_core::settings::keys;
use hostfleet_core::sms::SmsSender;
use hostfleet_core::{Error, Result};
use hostfleet_protocol::messages::{SmsSendRequest, SmsSendResult};
use hostfleet_protocol::{Service, methods};
use tracing::debug;

use crate::host::PluginHost;

/// Sends through the SMS instance selected in settings.
pub struct PluginSmsSender {
    host: Arc<PluginHost>,
}

impl PluginSmsSender {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self { host }
    }

    async fn selected(&self) -> Result<InstanceKey> {
        let settings = self.host.settings();
        let plugin_id = settings.get_string(keys::SMS_PLUGIN_ID, "").await?;
        let plugin_id = plugin_id.trim();
        if plugin_id.is_empty() {
            return Err(Error::FailedPrecondition("no sms plugin configured".into()));
        }
        let instance_id = settings
            .get_string(keys::SMS_INSTANCE_ID, DEFAULT_INSTANCE_ID)
            .await?;
        let instance_id = match instance_id.trim() {
            "" => DEFAULT_INSTANCE_ID,
            id => id,
        };
        Ok(InstanceKey::new(PluginCategory::Sms, plugin_id, instance_id))
    }
}

#[async_trait]
impl SmsSender for PluginSmsSender {
    async fn send(&self, message: SmsSendRequest) -> Result<String> {
        if message.phones.is_empty() {
            return Err(Error::invalid("no recipients"));
        }
        let key = self.selected().await?;
        self.host.ensure_loaded(&key).await?;
        let result: SmsSendResult = self
            .host
            .call(&key, Service::Sms, methods::SMS_SEND, &message)
            .await?;
        if !result.ok {
            let reason = if result.error.is_empty() {
                "send rejected".to_string()
            } else {
                result.error
            };
            return Err(Error::FailedPrecondition(format!("{key}: {reason}")));
        }
        debug!(plugin = %key, recipients = message.phones.len(), message_id = %result.message_id, "SMS sent");
        Ok(result.message_id)
    }
}
