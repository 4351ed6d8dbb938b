// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client interface to the VPS control plane.
//!
//! Concrete clients come from automation plugins and are resolved per goods
//! type through [`AutomationResolver`]. Every method defaults to
//! [`Error::NotSupported`], so drivers only implement what they offer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostfleet_protocol::messages::{
    Area, CreateHostRequest, CreateHostResult, ElasticUpdateRequest, FirewallRuleCreate,
    HostInfo, HostSimple, Image, Line, Monitor, PortMappingCreate, Product, ResourceRow,
};

use crate::domain::VpsStatus;
use crate::error::{Error, Result};

fn unsupported<T>(op: &str) -> Result<T> {
    Err(Error::NotSupported(format!("automation {op} not supported")))
}

#[async_trait]
pub trait AutomationClient: Send + Sync {
    async fn create_host(&self, _req: CreateHostRequest) -> Result<CreateHostResult> {
        unsupported("create_host")
    }
    async fn get_host_info(&self, _host_id: i64) -> Result<HostInfo> {
        unsupported("get_host_info")
    }
    async fn list_host_simple(&self, _search_tag: &str) -> Result<Vec<HostSimple>> {
        unsupported("list_host_simple")
    }
    async fn elastic_update(&self, _req: ElasticUpdateRequest) -> Result<()> {
        unsupported("elastic_update")
    }
    async fn renew_host(&self, _host_id: i64, _next_due: DateTime<Utc>) -> Result<()> {
        unsupported("renew_host")
    }
    async fn lock_host(&self, _host_id: i64) -> Result<()> {
        unsupported("lock_host")
    }
    async fn unlock_host(&self, _host_id: i64) -> Result<()> {
        unsupported("unlock_host")
    }
    async fn delete_host(&self, _host_id: i64) -> Result<()> {
        unsupported("delete_host")
    }
    async fn start_host(&self, _host_id: i64) -> Result<()> {
        unsupported("start_host")
    }
    async fn shutdown_host(&self, _host_id: i64) -> Result<()> {
        unsupported("shutdown_host")
    }
    async fn reboot_host(&self, _host_id: i64) -> Result<()> {
        unsupported("reboot_host")
    }
    async fn reset_os(&self, _host_id: i64, _template_id: i64, _password: &str) -> Result<()> {
        unsupported("reset_os")
    }
    async fn reset_os_password(&self, _host_id: i64, _password: &str) -> Result<()> {
        unsupported("reset_os_password")
    }
    async fn list_snapshots(&self, _host_id: i64) -> Result<Vec<ResourceRow>> {
        unsupported("list_snapshots")
    }
    async fn create_snapshot(&self, _host_id: i64) -> Result<()> {
        unsupported("create_snapshot")
    }
    async fn delete_snapshot(&self, _host_id: i64, _snapshot_id: i64) -> Result<()> {
        unsupported("delete_snapshot")
    }
    async fn restore_snapshot(&self, _host_id: i64, _snapshot_id: i64) -> Result<()> {
        unsupported("restore_snapshot")
    }
    async fn list_backups(&self, _host_id: i64) -> Result<Vec<ResourceRow>> {
        unsupported("list_backups")
    }
    async fn create_backup(&self, _host_id: i64) -> Result<()> {
        unsupported("create_backup")
    }
    async fn delete_backup(&self, _host_id: i64, _backup_id: i64) -> Result<()> {
        unsupported("delete_backup")
    }
    async fn restore_backup(&self, _host_id: i64, _backup_id: i64) -> Result<()> {
        unsupported("restore_backup")
    }
    async fn list_firewall_rules(&self, _host_id: i64) -> Result<Vec<ResourceRow>> {
        unsupported("list_firewall_rules")
    }
    async fn add_firewall_rule(&self, _req: FirewallRuleCreate) -> Result<()> {
        unsupported("add_firewall_rule")
    }
    async fn delete_firewall_rule(&self, _host_id: i64, _rule_id: i64) -> Result<()> {
        unsupported("delete_firewall_rule")
    }
    async fn list_port_mappings(&self, _host_id: i64) -> Result<Vec<ResourceRow>> {
        unsupported("list_port_mappings")
    }
    async fn add_port_mapping(&self, _req: PortMappingCreate) -> Result<()> {
        unsupported("add_port_mapping")
    }
    async fn delete_port_mapping(&self, _host_id: i64, _mapping_id: i64) -> Result<()> {
        unsupported("delete_port_mapping")
    }
    async fn find_port_candidates(&self, _host_id: i64, _keywords: &str) -> Result<Vec<i64>> {
        unsupported("find_port_candidates")
    }
    async fn get_panel_url(&self, _host_name: &str, _panel_password: &str) -> Result<String> {
        unsupported("get_panel_url")
    }
    async fn list_areas(&self) -> Result<Vec<Area>> {
        unsupported("list_areas")
    }
    async fn list_images(&self, _line_id: i64) -> Result<Vec<Image>> {
        unsupported("list_images")
    }
    async fn list_lines(&self) -> Result<Vec<Line>> {
        unsupported("list_lines")
    }
    async fn list_products(&self, _line_id: i64) -> Result<Vec<Product>> {
        unsupported("list_products")
    }
    async fn get_monitor(&self, _host_id: i64) -> Result<Monitor> {
        unsupported("get_monitor")
    }
    async fn get_vnc_url(&self, _host_id: i64) -> Result<String> {
        unsupported("get_vnc_url")
    }
}

/// Finds the automation client bound to a goods type.
#[async_trait]
pub trait AutomationResolver: Send + Sync {
    /// `goods_type_id <= 0` selects the default goods type. `InvalidInput`
    /// when the goods type has no binding or its plugin is not loaded.
    async fn client_for_goods_type(&self, goods_type_id: i64) -> Result<Arc<dyn AutomationClient>>;
}

/// Automation state code to VPS status.
pub fn map_host_state(state: i32) -> VpsStatus {
    match state {
        0 | 1 | 13 => VpsStatus::Provisioning,
        2 => VpsStatus::Running,
        3 => VpsStatus::Stopped,
        4 => VpsStatus::Reinstalling,
        5 => VpsStatus::ReinstallFailed,
        10 => VpsStatus::Locked,
        _ => VpsStatus::Unknown,
    }
}
