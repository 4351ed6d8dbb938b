// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`AutomationClient`] backed by an automation plugin instance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostfleet_core::Result;
use hostfleet_core::automation::AutomationClient;
use hostfleet_core::domain::InstanceKey;
use hostfleet_protocol::messages::{
    Area, CreateHostRequest, CreateHostResult, ElasticUpdateRequest, FirewallRuleCreate,
    HostInfo, HostRef, HostResourceRef, HostSearch, HostSimple, Image, Items, Line, LineRef,
    Monitor, PanelUrlRequest, PortCandidates, PortCandidatesRequest, PortMappingCreate, Product,
    RenewHostRequest, ResetOsRequest, ResetPasswordRequest, ResourceList, ResourceRow, UrlResult,
};
use hostfleet_protocol::methods::automation as m;
use hostfleet_protocol::Service;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::expect_ok;
use crate::host::PluginHost;

pub struct AutomationPluginClient {
    host: Arc<PluginHost>,
    key: InstanceKey,
}

impl AutomationPluginClient {
    pub fn new(host: Arc<PluginHost>, key: InstanceKey) -> Self {
        Self { host, key }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.host
            .call(&self.key, Service::Automation, method, params)
            .await
    }

    /// For operations without a result body.
    async fn exec<P: Serialize + Sync>(&self, method: &str, params: &P) -> Result<()> {
        let reply: Value = self.call(method, params).await?;
        expect_ok(&self.key, method, &reply)
    }

    async fn rows(&self, method: &str, host_id: i64) -> Result<Vec<ResourceRow>> {
        let list: ResourceList = self.call(method, &HostRef { host_id }).await?;
        Ok(list.items)
    }

    async fn resource(&self, method: &str, host_id: i64, resource_id: i64) -> Result<()> {
        self.exec(method, &HostResourceRef {
            host_id,
            resource_id,
        })
        .await
    }
}

#[async_trait]
impl AutomationClient for AutomationPluginClient {
    async fn create_host(&self, req: CreateHostRequest) -> Result<CreateHostResult> {
        self.call(m::CREATE_HOST, &req).await
    }

    async fn get_host_info(&self, host_id: i64) -> Result<HostInfo> {
        self.call(m::GET_HOST_INFO, &HostRef { host_id }).await
    }

    async fn list_host_simple(&self, search_tag: &str) -> Result<Vec<HostSimple>> {
        let list: Items<HostSimple> = self
            .call(m::LIST_HOST_SIMPLE, &HostSearch {
                search_tag: search_tag.to_string(),
            })
            .await?;
        Ok(list.items)
    }

    async fn elastic_update(&self, req: ElasticUpdateRequest) -> Result<()> {
        self.exec(m::ELASTIC_UPDATE, &req).await
    }

    async fn renew_host(&self, host_id: i64, next_due: DateTime<Utc>) -> Result<()> {
        self.exec(m::RENEW_HOST, &RenewHostRequest {
            host_id,
            next_due_date: next_due,
        })
        .await
    }

    async fn lock_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::LOCK_HOST, &HostRef { host_id }).await
    }

    async fn unlock_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::UNLOCK_HOST, &HostRef { host_id }).await
    }

    async fn delete_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::DELETE_HOST, &HostRef { host_id }).await
    }

    async fn start_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::START_HOST, &HostRef { host_id }).await
    }

    async fn shutdown_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::SHUTDOWN_HOST, &HostRef { host_id }).await
    }

    async fn reboot_host(&self, host_id: i64) -> Result<()> {
        self.exec(m::REBOOT_HOST, &HostRef { host_id }).await
    }

    async fn reset_os(&self, host_id: i64, template_id: i64, password: &str) -> Result<()> {
        self.exec(m::RESET_OS, &ResetOsRequest {
            host_id,
            template_id,
            password: password.to_string(),
        })
        .await
    }

    async fn reset_os_password(&self, host_id: i64, password: &str) -> Result<()> {
        self.exec(m::RESET_OS_PASSWORD, &ResetPasswordRequest {
            host_id,
            password: password.to_string(),
        })
        .await
    }

    async fn list_snapshots(&self, host_id: i64) -> Result<Vec<ResourceRow>> {
        self.rows(m::LIST_SNAPSHOTS, host_id).await
    }

    async fn create_snapshot(&self, host_id: i64) -> Result<()> {
        self.exec(m::CREATE_SNAPSHOT, &HostRef { host_id }).await
    }

    async fn delete_snapshot(&self, host_id: i64, snapshot_id: i64) -> Result<()> {
        self.resource(m::DELETE_SNAPSHOT, host_id, snapshot_id).await
    }

    async fn restore_snapshot(&self, host_id: i64, snapshot_id: i64) -> Result<()> {
        self.resource(m::RESTORE_SNAPSHOT, host_id, snapshot_id).await
    }

    async fn list_backups(&self, host_id: i64) -> Result<Vec<ResourceRow>> {
        self.rows(m::LIST_BACKUPS, host_id).await
    }

    async fn create_backup(&self, host_id: i64) -> Result<()> {
        self.exec(m::CREATE_BACKUP, &HostRef { host_id }).await
    }

    async fn delete_backup(&self, host_id: i64, backup_id: i64) -> Result<()> {
        self.resource(m::DELETE_BACKUP, host_id, backup_id).await
    }

    async fn restore_backup(&self, host_id: i64, backup_id: i64) -> Result<()> {
        self.resource(m::RESTORE_BACKUP, host_id, backup_id).await
    }

    async fn list_firewall_rules(&self, host_id: i64) -> Result<Vec<ResourceRow>> {
        self.rows(m::LIST_FIREWALL_RULES, host_id).await
    }

    async fn add_firewall_rule(&self, req: FirewallRuleCreate) -> Result<()> {
        self.exec(m::ADD_FIREWALL_RULE, &req).await
    }

    async fn delete_firewall_rule(&self, host_id: i64, rule_id: i64) -> Result<()> {
        self.resource(m::DELETE_FIREWALL_RULE, host_id, rule_id).await
    }

    async fn list_port_mappings(&self, host_id: i64) -> Result<Vec<ResourceRow>> {
        self.rows(m::LIST_PORT_MAPPINGS, host_id).await
    }

    async fn add_port_mapping(&self, req: PortMappingCreate) -> Result<()> {
        self.exec(m::ADD_PORT_MAPPING, &req).await
    }

    async fn delete_port_mapping(&self, host_id: i64, mapping_id: i64) -> Result<()> {
        self.resource(m::DELETE_PORT_MAPPING, host_id, mapping_id).await
    }

    async fn find_port_candidates(&self, host_id: i64, keywords: &str) -> Result<Vec<i64>> {
        let found: PortCandidates = self
            .call(m::FIND_PORT_CANDIDATES, &PortCandidatesRequest {
                host_id,
                keywords: keywords.to_string(),
            })
            .await?;
        Ok(found.ports)
    }

    async fn get_panel_url(&self, host_name: &str, panel_password: &str) -> Result<String> {
        let url: UrlResult = self
            .call(m::GET_PANEL_URL, &PanelUrlRequest {
                host_name: host_name.to_string(),
                panel_password: panel_password.to_string(),
            })
            .await?;
        Ok(url.url)
    }

    async fn list_areas(&self) -> Result<Vec<Area>> {
        let list: Items<Area> = self.call(m::LIST_AREAS, &serde_json::json!({})).await?;
        Ok(list.items)
    }

    async fn list_images(&self, line_id: i64) -> Result<Vec<Image>> {
        let list: Items<Image> = self.call(m::LIST_IMAGES, &LineRef { line_id }).await?;
        Ok(list.items)
    }

    async fn list_lines(&self) -> Result<Vec<Line>> {
        let list: Items<Line> = self.call(m::LIST_LINES, &serde_json::json!({})).await?;
        Ok(list.items)
    }

    async fn list_products(&self, line_id: i64) -> Result<Vec<Product>> {
        let list: Items<Product> = self.call(m::LIST_PRODUCTS, &LineRef { line_id }).await?;
        Ok(list.items)
    }

    async fn get_monitor(&self, host_id: i64) -> Result<Monitor> {
        self.call(m::GET_MONITOR, &HostRef { host_id }).await
    }

    async fn get_vnc_url(&self, host_id: i64) -> Result<String> {
        let url: UrlResult = self.call(m::GET_VNC_URL, &HostRef { host_id }).await?;
        Ok(url.url)
    }
}
