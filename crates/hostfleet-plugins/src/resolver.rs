// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Goods type to automation instance binding.

use std::sync::Arc;

use async_trait::async_trait;
use hostfleet_core::automation::{AutomationClient, AutomationResolver};
use hostfleet_core::domain::{DEFAULT_INSTANCE_ID, GoodsType, InstanceKey, PluginCategory};
use hostfleet_core::store::CatalogRepository;
use hostfleet_core::{Error, Result};

use crate::clients::AutomationPluginClient;
use crate::host::PluginHost;

pub struct PluginAutomationResolver {
    host: Arc<PluginHost>,
    catalog: Arc<dyn CatalogRepository>,
}

impl PluginAutomationResolver {
    pub fn new(host: Arc<PluginHost>, catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { host, catalog }
    }

    /// `goods_type_id <= 0` picks the first active goods type.
    async fn goods_type(&self, goods_type_id: i64) -> Result<GoodsType> {
        if goods_type_id > 0 {
            return self.catalog.get_goods_type(goods_type_id).await;
        }
        self.catalog
            .list_goods_types()
            .await?
            .into_iter()
            .filter(|g| g.active)
            .min_by_key(|g| (g.sort_order, g.id))
            .ok_or_else(|| Error::invalid("no active goods type"))
    }
}

fn binding(goods_type: &GoodsType) -> Result<InstanceKey> {
    let category = match goods_type.automation_category.trim() {
        "" => PluginCategory::Automation,
        raw => raw
            .parse()
            .map_err(|_| Error::invalid(format!("goods type {} has unknown category {raw}", goods_type.id)))?,
    };
    if category != PluginCategory::Automation {
        return Err(Error::invalid(format!(
            "goods type {} is bound to a {category} plugin",
            goods_type.id
        )));
    }
    let plugin_id = goods_type.automation_plugin_id.trim();
    if plugin_id.is_empty() {
        return Err(Error::invalid(format!(
            "goods type {} has no automation plugin",
            goods_type.id
        )));
    }
    let instance_id = match goods_type.automation_instance_id.trim() {
        "" => DEFAULT_INSTANCE_ID,
        id => id,
    };
    Ok(InstanceKey::new(category, plugin_id, instance_id))
}

#[async_trait]
impl AutomationResolver for PluginAutomationResolver {
    async fn client_for_goods_type(&self, goods_type_id: i64) -> Result<Arc<dyn AutomationClient>> {
        let goods_type = self.goods_type(goods_type_id).await?;
        let key = binding(&goods_type)?;
        if !self.host.is_loaded(&key) {
            return Err(Error::invalid(format!("automation instance {key} is not loaded")));
        }
        Ok(Arc::new(AutomationPluginClient::new(self.host.clone(), key)))
    }
}
