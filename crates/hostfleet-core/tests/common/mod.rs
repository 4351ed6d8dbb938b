// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hostfleet-core scenario tests.
//!
//! Provides TestContext wiring a store, the event bus, the provisioning
//! engine and the order service around an in-process automation driver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hostfleet_core::automation::{AutomationClient, AutomationResolver};
use hostfleet_core::domain::{CartSpec, Package, PlanGroup, User, UserRole};
use hostfleet_core::events::EventBus;
use hostfleet_core::kyc::{KycProviderRegistry, KycService};
use hostfleet_core::orders::{OrderLine, OrderService};
use hostfleet_core::provisioning::ProvisioningEngine;
use hostfleet_core::settings::SettingsReader;
use hostfleet_core::store::SqliteStore;
use hostfleet_core::tier::TierService;
use hostfleet_core::wallet::WalletService;
use hostfleet_core::{Error, Result, Store};
use hostfleet_protocol::messages::{
    CreateHostRequest, CreateHostResult, ElasticUpdateRequest, HostInfo,
};

/// Automation driver that keeps hosts in memory and reports them running.
#[derive(Default)]
pub struct TestAutomation {
    next_id: AtomicI64,
    pub hosts: Mutex<HashMap<i64, HostInfo>>,
    pub calls: Mutex<Vec<String>>,
}

impl TestAutomation {
    pub fn called(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == op).count()
    }
}

#[async_trait]
impl AutomationClient for TestAutomation {
    async fn create_host(&self, req: CreateHostRequest) -> Result<CreateHostResult> {
        self.calls.lock().push("create_host".into());
        let host_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 500;
        let info = HostInfo {
            host_id,
            host_name: req.host_name,
            state: 2,
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk_gb: req.disk_gb,
            bandwidth: req.bandwidth,
            os_password: req.sys_pwd,
            remote_ip: format!("192.0.2.{}", host_id % 250),
            expire_at: Some(req.expire_time),
            ..Default::default()
        };
        self.hosts.lock().insert(host_id, info);
        Ok(CreateHostResult { host_id })
    }

    async fn get_host_info(&self, host_id: i64) -> Result<HostInfo> {
        self.hosts
            .lock()
            .get(&host_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("host {host_id}")))
    }

    async fn elastic_update(&self, req: ElasticUpdateRequest) -> Result<()> {
        self.calls.lock().push("elastic_update".into());
        let mut hosts = self.hosts.lock();
        let h = hosts
            .get_mut(&req.host_id)
            .ok_or_else(|| Error::not_found(format!("host {}", req.host_id)))?;
        if let Some(v) = req.cpu {
            h.cpu = v;
        }
        if let Some(v) = req.memory_gb {
            h.memory_gb = v;
        }
        Ok(())
    }

    async fn renew_host(&self, host_id: i64, next_due: DateTime<Utc>) -> Result<()> {
        if let Some(h) = self.hosts.lock().get_mut(&host_id) {
            h.expire_at = Some(next_due);
        }
        Ok(())
    }
}

pub struct SingleResolver(pub Arc<TestAutomation>);

#[async_trait]
impl AutomationResolver for SingleResolver {
    async fn client_for_goods_type(&self, _goods_type_id: i64) -> Result<Arc<dyn AutomationClient>> {
        Ok(self.0.clone())
    }
}

/// Test context holding every service a scenario drives.
pub struct TestContext {
    pub store: Store,
    pub events: Arc<EventBus>,
    pub automation: Arc<TestAutomation>,
    pub engine: Arc<ProvisioningEngine>,
    pub tier: TierService,
    pub orders: OrderService,
    pub wallet: WalletService,
    pub settings: SettingsReader,
    pub kyc: Option<Arc<KycService>>,
    pub package: Package,
    _temp_dir: Option<tempfile::TempDir>,
}

impl TestContext {
    /// Context over the in-memory backend.
    pub async fn new() -> Self {
        Self::build(Store::in_memory(), None, None).await
    }

    /// Context over a SQLite file in a temp directory.
    pub async fn sqlite() -> Self {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let backend = SqliteStore::from_path(dir.path().join("hostfleet.db"))
            .await
            .expect("Failed to open SQLite store");
        Self::build(Store::new(Arc::new(backend)), None, Some(dir)).await
    }

    /// In-memory context whose order service is gated by real-name checks
    /// against `registry`.
    pub async fn with_kyc(registry: Arc<dyn KycProviderRegistry>) -> Self {
        Self::build(Store::in_memory(), Some(registry), None).await
    }

    async fn build(
        store: Store,
        kyc_registry: Option<Arc<dyn KycProviderRegistry>>,
        temp_dir: Option<tempfile::TempDir>,
    ) -> Self {
        let settings = SettingsReader::new(store.settings.clone());
        let automation = Arc::new(TestAutomation::default());
        let events = Arc::new(EventBus::new(store.events.clone()));
        let engine = Arc::new(ProvisioningEngine::new(
            store.clone(),
            events.clone(),
            Arc::new(SingleResolver(automation.clone())),
        ));
        let tier = TierService::new(store.clone());
        let mut orders = OrderService::new(store.clone(), events.clone(), engine.clone())
            .with_tier(Arc::new(tier.clone()));
        let kyc = kyc_registry.map(|registry| {
            Arc::new(KycService::new(
                store.realname.clone(),
                registry,
                settings.clone(),
            ))
        });
        if let Some(kyc) = &kyc {
            orders = orders.with_gate(kyc.clone());
        }
        let package = seed_catalog(&store).await;
        Self {
            wallet: WalletService::new(store.wallets.clone()),
            settings,
            kyc,
            store,
            events,
            automation,
            engine,
            tier,
            orders,
            package,
            _temp_dir: temp_dir,
        }
    }

    pub async fn user(&self, name: &str) -> User {
        let user = self
            .store
            .users
            .create_user(User::new(name, UserRole::User))
            .await
            .expect("Failed to create user");
        self.tier
            .ensure_user_has_group(user.id)
            .await
            .expect("Failed to assign default group");
        user
    }

    pub async fn fund(&self, user_id: i64, amount: i64) {
        let credited = self
            .wallet
            .credit_once(user_id, amount, "topup", user_id * 10_000 + amount, "test top-up")
            .await
            .expect("Failed to fund wallet");
        assert!(credited);
    }

    pub fn line(&self) -> OrderLine {
        OrderLine::new(self.package.id, 0, CartSpec::default(), 1)
    }
}

async fn seed_catalog(store: &Store) -> Package {
    let plan = store
        .catalog
        .create_plan_group(PlanGroup {
            id: 0,
            goods_type_id: 1,
            region_id: 1,
            name: "tokyo".into(),
            line_id: 4,
            unit_core: 300,
            unit_mem: 200,
            unit_disk: 10,
            unit_bw: 50,
            add_core_min: 0,
            add_core_max: 8,
            add_core_step: 1,
            add_mem_min: 0,
            add_mem_max: 8,
            add_mem_step: 1,
            add_disk_min: 0,
            add_disk_max: 100,
            add_disk_step: 10,
            add_bw_min: 0,
            add_bw_max: 100,
            add_bw_step: 1,
            active: true,
        })
        .await
        .expect("Failed to create plan group");
    store
        .catalog
        .create_package(Package {
            id: 0,
            plan_group_id: plan.id,
            goods_type_id: 1,
            product_id: 0,
            name: "nano".into(),
            cores: 1,
            memory_gb: 1,
            disk_gb: 20,
            bandwidth_mbps: 5,
            port_num: 10,
            monthly_price: 1000,
            active: true,
        })
        .await
        .expect("Failed to create package")
}
