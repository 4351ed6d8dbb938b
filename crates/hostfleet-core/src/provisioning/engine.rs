// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning engine.
//!
//! Approved orders are dispatched item by item:
//!
//! ```text
//! create  -> ProvisionJob  -> CreateHost -> poll GetHostInfo until ready -> VPS running
//! resize  -> ResizeTask    -> ElasticUpdate -> instance updated, refund credited
//! renew   -> applied now   -> RenewHost (+ UnlockHost)
//! refund  -> applied now   -> wallet credit or gateway refund, DeleteHost
//! ```
//!
//! Jobs and tasks live in the store and are driven by scheduled tasks, so a
//! restart picks up where the previous process stopped. Every automation
//! call writes an [`AutomationLog`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use hostfleet_protocol::messages::{CreateHostRequest, ElasticUpdateRequest, HostInfo};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationClient, AutomationResolver, map_host_state};
use crate::domain::{
    AdminStatus, AutomationLog, CartSpec, ItemAction, ItemStatus, JobStatus, Order, OrderItem,
    OrderStatus, ProvisionJob, ResizeSpec, ResizeTask, VpsInstance, VpsStatus, event_types,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::payment::PaymentProviderRegistry;
use crate::settings::{SettingsReader, keys};
use crate::store::Store;
use crate::wallet::{WalletService, refs};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Jobs or tasks handled per run.
    pub batch_size: i64,
    /// Failed attempts before an item is given up.
    pub max_attempts: i32,
    /// Delay after the n-th failed attempt; the last entry repeats.
    pub backoff: Vec<Duration>,
    /// Delay between readiness polls of a freshly created host.
    pub ready_poll: Duration,
    /// Used when a package has no port count.
    pub default_port_num: i32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 5,
            backoff: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(600),
            ],
            ready_poll: Duration::from_secs(10),
            default_port_num: 30,
        }
    }
}

impl ProvisioningConfig {
    /// Delay before retrying after `attempts` failed attempts.
    pub fn backoff_after(&self, attempts: i32) -> Duration {
        let idx = (attempts.max(1) - 1) as usize;
        self.backoff
            .get(idx)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Default minutes an order may stay in `provisioning` before the watchdog acts.
pub const DEFAULT_WATCHDOG_MINUTES: i64 = 30;

/// Order and item an automation call is made for.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CallContext {
    pub order_id: i64,
    pub item_id: i64,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(60))
}

pub(crate) fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Access credentials kept on the instance.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
struct AccessInfo {
    #[serde(default)]
    remote_ip: String,
    #[serde(default)]
    panel_password: String,
    #[serde(default)]
    vnc_password: String,
    #[serde(default)]
    os_password: String,
}

impl AccessInfo {
    fn merge(&mut self, info: &HostInfo) {
        let set = |slot: &mut String, v: &str| {
            if !v.is_empty() {
                *slot = v.to_string();
            }
        };
        set(&mut self.remote_ip, &info.remote_ip);
        set(&mut self.panel_password, &info.panel_password);
        set(&mut self.vnc_password, &info.vnc_password);
        set(&mut self.os_password, &info.os_password);
    }
}

/// Copy live host facts onto the instance.
pub(crate) fn apply_host_info(vps: &mut VpsInstance, info: &HostInfo) {
    vps.status = map_host_state(info.state);
    vps.automation_state = info.state;
    if info.cpu > 0 {
        vps.cpu = info.cpu;
    }
    if info.memory_gb > 0 {
        vps.memory_gb = info.memory_gb;
    }
    if info.disk_gb > 0 {
        vps.disk_gb = info.disk_gb;
    }
    if info.bandwidth > 0 {
        vps.bandwidth_mbps = info.bandwidth;
    }
    if info.expire_at.is_some() {
        vps.expire_at = info.expire_at;
    }
    let mut access: AccessInfo = serde_json::from_str(&vps.access_info_json).unwrap_or_default();
    access.merge(info);
    if let Ok(s) = serde_json::to_string(&access) {
        vps.access_info_json = s;
    }
}

/// Status an order should have given its items, if it should change.
pub(crate) fn derive_order_status(items: &[OrderItem]) -> Option<OrderStatus> {
    if items.is_empty() {
        return None;
    }
    let in_progress = items
        .iter()
        .any(|i| matches!(i.status, ItemStatus::Approved | ItemStatus::Provisioning));
    if in_progress {
        return Some(OrderStatus::Provisioning);
    }
    if items.iter().all(|i| i.status == ItemStatus::Active) {
        return Some(OrderStatus::Active);
    }
    if items.iter().any(|i| i.status == ItemStatus::Failed) {
        return Some(OrderStatus::Failed);
    }
    None
}

/// Runs provision jobs, resize tasks and lifecycle actions against automation.
pub struct ProvisioningEngine {
    pub(crate) store: Store,
    pub(crate) events: Arc<EventBus>,
    pub(crate) resolver: Arc<dyn AutomationResolver>,
    pub(crate) settings: SettingsReader,
    pub(crate) wallet: WalletService,
    pub(crate) payments: Option<Arc<dyn PaymentProviderRegistry>>,
    pub(crate) config: ProvisioningConfig,
}

impl ProvisioningEngine {
    pub fn new(store: Store, events: Arc<EventBus>, resolver: Arc<dyn AutomationResolver>) -> Self {
        Self {
            settings: SettingsReader::new(store.settings.clone()),
            wallet: WalletService::new(store.wallets.clone()),
            store,
            events,
            resolver,
            payments: None,
            config: ProvisioningConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProvisioningConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry used to refund gateway payments back to their origin.
    pub fn with_payments(mut self, payments: Arc<dyn PaymentProviderRegistry>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    pub(crate) async fn client_for(&self, goods_type_id: i64) -> Result<Arc<dyn AutomationClient>> {
        self.resolver.client_for_goods_type(goods_type_id).await
    }

    /// Record an automation call. Logging failures never fail the call.
    pub(crate) async fn log_call<Req: Serialize, Resp: Serialize>(
        &self,
        ctx: CallContext,
        action: &str,
        request: &Req,
        result: &Result<Resp>,
    ) {
        let (response_json, success, message) = match result {
            Ok(resp) => (
                serde_json::to_string(resp).unwrap_or_default(),
                true,
                "ok".to_string(),
            ),
            Err(e) => (String::new(), false, e.to_string()),
        };
        let log = AutomationLog {
            id: 0,
            order_id: ctx.order_id,
            order_item_id: ctx.item_id,
            action: action.to_string(),
            request_json: serde_json::to_string(request).unwrap_or_default(),
            response_json,
            success,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.automation_logs.add_automation_log(log).await {
            warn!(action, error = %e, "Failed to write automation log");
        }
    }

    async fn publish_item(&self, order: &Order, item: &OrderItem, event_type: &str, extra: serde_json::Value) {
        let mut payload = json!({
            "order_no": order.order_no,
            "item_id": item.id,
            "action": item.action,
            "status": item.status,
            "vps_id": item.vps_id,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        if let Err(e) = self.events.publish(order.id, event_type, &payload).await {
            warn!(order_id = order.id, event_type, error = %e, "Failed to publish item event");
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Start the work behind an approved order.
    pub async fn dispatch_order(&self, order_id: i64) -> Result<Order> {
        let order = self.store.orders.get_order(order_id).await?;
        if order.status != OrderStatus::Approved {
            return Err(Error::conflict(format!(
                "order {} is {}, not approved",
                order.order_no, order.status
            )));
        }
        let items = self.store.orders.list_order_items(order.id).await?;
        info!(order_id = order.id, order_no = %order.order_no, items = items.len(), "Dispatching order");

        let mut refunded = false;
        for mut item in items {
            if !matches!(item.status, ItemStatus::PendingPayment | ItemStatus::Approved) {
                continue;
            }
            let outcome = match item.action {
                ItemAction::Create => self.enqueue_provision(&order, &mut item).await,
                ItemAction::Resize => self.enqueue_resize(&order, &mut item).await,
                ItemAction::Renew => self.apply_renew_item(&order, &mut item).await,
                ItemAction::Refund => {
                    let r = self.apply_refund_item(&order, &mut item).await;
                    refunded |= r.is_ok();
                    r
                }
            };
            if let Err(e) = outcome {
                error!(order_id = order.id, item_id = item.id, action = %item.action, error = %e, "Order item failed");
                self.fail_item(&order, &mut item, &e.to_string()).await?;
            }
        }

        if refunded {
            let mut order = self.store.orders.get_order(order.id).await?;
            order.status = OrderStatus::Refunded;
            self.store.orders.update_order(&order).await?;
            let payload = json!({
                "order_no": order.order_no,
                "status": order.status,
                "total": order.total_amount,
            });
            if let Err(e) = self.events.publish(order.id, event_types::ORDER_REFUNDED, &payload).await {
                warn!(order_id = order.id, error = %e, "Failed to publish refund event");
            }
            return Ok(order);
        }
        self.refresh_order_status(order.id).await
    }

    async fn enqueue_provision(&self, order: &Order, item: &mut OrderItem) -> Result<()> {
        if self
            .store
            .provision_jobs
            .get_provision_job_by_item(item.id)
            .await?
            .is_none()
        {
            let now = Utc::now();
            self.store
                .provision_jobs
                .create_provision_job(ProvisionJob {
                    id: 0,
                    order_id: order.id,
                    order_item_id: item.id,
                    host_id: 0,
                    host_name: String::new(),
                    status: JobStatus::Pending,
                    attempts: 0,
                    next_run_at: now,
                    last_error: String::new(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
        item.status = ItemStatus::Provisioning;
        self.store.orders.update_order_item(item).await?;
        self.publish_item(order, item, event_types::ITEM_PROVISIONING, json!({})).await;
        Ok(())
    }

    async fn enqueue_resize(&self, order: &Order, item: &mut OrderItem) -> Result<()> {
        let spec: ResizeSpec = serde_json::from_str(&item.spec_json)?;
        let now = Utc::now();
        let created = self
            .store
            .resize_tasks
            .create_resize_task(ResizeTask {
                id: 0,
                vps_id: spec.vps_id,
                order_id: order.id,
                order_item_id: item.id,
                status: JobStatus::Pending,
                attempts: 0,
                next_run_at: now,
                last_error: String::new(),
                created_at: now,
                updated_at: now,
            })
            .await;
        match created {
            Ok(task) => debug!(task_id = task.id, vps_id = spec.vps_id, "Resize task queued"),
            Err(Error::Conflict(_)) => return Err(Error::ResizeInProgress),
            Err(e) => return Err(e),
        }
        item.status = ItemStatus::Provisioning;
        self.store.orders.update_order_item(item).await?;
        self.publish_item(order, item, event_types::ITEM_PROVISIONING, json!({})).await;
        Ok(())
    }

    pub(crate) async fn fail_item(&self, order: &Order, item: &mut OrderItem, reason: &str) -> Result<()> {
        item.status = ItemStatus::Failed;
        self.store.orders.update_order_item(item).await?;
        self.publish_item(order, item, event_types::ITEM_FAILED, json!({ "error": reason }))
            .await;
        Ok(())
    }

    pub(crate) async fn complete_item(&self, order: &Order, item: &mut OrderItem) -> Result<()> {
        item.status = ItemStatus::Active;
        self.store.orders.update_order_item(item).await?;
        self.publish_item(order, item, event_types::ITEM_PROVISIONED, json!({}))
            .await;
        Ok(())
    }

    /// Recompute the order status from its items.
    pub async fn refresh_order_status(&self, order_id: i64) -> Result<Order> {
        let mut order = self.store.orders.get_order(order_id).await?;
        if matches!(
            order.status,
            OrderStatus::Refunded | OrderStatus::Canceled | OrderStatus::Rejected
        ) {
            return Ok(order);
        }
        let items = self.store.orders.list_order_items(order.id).await?;
        if let Some(status) = derive_order_status(&items) {
            if status != order.status {
                info!(order_id = order.id, from = %order.status, to = %status, "Order status changed");
                order.status = status;
                self.store.orders.update_order(&order).await?;
            }
        }
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Provision jobs
    // ------------------------------------------------------------------

    /// Run due provision jobs. Returns how many were handled.
    pub async fn run_provision_jobs(&self) -> Result<usize> {
        self.run_provision_jobs_at(Utc::now()).await
    }

    pub async fn run_provision_jobs_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self
            .store
            .provision_jobs
            .list_due_provision_jobs(now, self.config.batch_size)
            .await?;
        let count = jobs.len();
        for job in jobs {
            let job_id = job.id;
            if let Err(e) = self.process_job(job).await {
                error!(job_id, error = %e, "Provision job failed unexpectedly");
            }
        }
        Ok(count)
    }

    async fn process_job(&self, mut job: ProvisionJob) -> Result<()> {
        job.status = JobStatus::Running;
        self.store.provision_jobs.update_provision_job(&job).await?;

        let order = self.store.orders.get_order(job.order_id).await?;
        let mut item = self.store.orders.get_order_item(job.order_item_id).await?;
        let ctx = CallContext {
            order_id: order.id,
            item_id: item.id,
        };

        let client = match self.client_for(item.goods_type_id).await {
            Ok(c) => c,
            Err(e) => return self.job_attempt_failed(&order, &mut item, job, e).await,
        };

        if job.host_id == 0 {
            match self.create_host(&order, &mut item, client.as_ref(), &mut job).await {
                Ok(()) => {}
                Err(e) => return self.job_attempt_failed(&order, &mut item, job, e).await,
            }
        }

        let info = client.get_host_info(job.host_id).await;
        self.log_call(ctx, "get_host_info", &json!({ "host_id": job.host_id }), &info)
            .await;
        let info = match info {
            Ok(info) => info,
            Err(e) => return self.job_attempt_failed(&order, &mut item, job, e).await,
        };

        match info.state {
            2 | 3 | 10 => {
                if let Some(mut vps) = self.store.vps.get_instance_by_order_item(item.id).await? {
                    apply_host_info(&mut vps, &info);
                    self.store.vps.update_instance(&vps).await?;
                }
                job.status = JobStatus::Succeeded;
                job.last_error.clear();
                self.store.provision_jobs.update_provision_job(&job).await?;
                self.complete_item(&order, &mut item).await?;
                info!(order_id = order.id, item_id = item.id, host_id = job.host_id, "Host provisioned");
                self.refresh_order_status(order.id).await?;
            }
            5 | 11 => {
                let reason = format!("host {} entered failure state {}", job.host_id, info.state);
                job.status = JobStatus::Failed;
                job.last_error = reason.clone();
                self.store.provision_jobs.update_provision_job(&job).await?;
                self.fail_item(&order, &mut item, &reason).await?;
                warn!(order_id = order.id, item_id = item.id, state = info.state, "Host provisioning failed");
                self.refresh_order_status(order.id).await?;
            }
            state => {
                debug!(job_id = job.id, host_id = job.host_id, state, "Host not ready yet");
                job.status = JobStatus::Pending;
                job.next_run_at = Utc::now() + to_chrono(self.config.ready_poll);
                self.store.provision_jobs.update_provision_job(&job).await?;
            }
        }
        Ok(())
    }

    async fn job_attempt_failed(
        &self,
        order: &Order,
        item: &mut OrderItem,
        mut job: ProvisionJob,
        err: Error,
    ) -> Result<()> {
        job.attempts += 1;
        job.last_error = err.to_string();
        if job.attempts >= self.config.max_attempts {
            job.status = JobStatus::Failed;
            self.store.provision_jobs.update_provision_job(&job).await?;
            error!(job_id = job.id, attempts = job.attempts, error = %err, "Provision job gave up");
            self.fail_item(order, item, &job.last_error).await?;
            self.refresh_order_status(order.id).await?;
        } else {
            let delay = self.config.backoff_after(job.attempts);
            job.status = JobStatus::Pending;
            job.next_run_at = Utc::now() + to_chrono(delay);
            self.store.provision_jobs.update_provision_job(&job).await?;
            warn!(
                job_id = job.id,
                attempts = job.attempts,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "Provision attempt failed, retrying"
            );
        }
        Ok(())
    }

    /// Call `CreateHost` for the item and persist the new instance.
    async fn create_host(
        &self,
        order: &Order,
        item: &mut OrderItem,
        client: &dyn AutomationClient,
        job: &mut ProvisionJob,
    ) -> Result<()> {
        let ctx = CallContext {
            order_id: order.id,
            item_id: item.id,
        };
        let package = self.store.catalog.get_package(item.package_id).await?;
        let plan = self.store.catalog.get_plan_group(package.plan_group_id).await?;
        let spec: CartSpec = serde_json::from_str(&item.spec_json).unwrap_or_default();
        let os = if item.system_id > 0 {
            self.store
                .catalog
                .get_system_image(item.system_id)
                .await
                .map(|img| img.name)
                .unwrap_or_default()
        } else {
            String::new()
        };

        let now = Utc::now();
        let months = item.duration_months.max(1) as u32;
        let expire = now
            .checked_add_months(Months::new(months))
            .unwrap_or(now + chrono::Duration::days(30 * months as i64));
        let host_name = format!(
            "ecs-{}-{}",
            order.user_id,
            now.timestamp_nanos_opt().unwrap_or(now.timestamp_micros())
        );
        let port_num = if package.port_num > 0 {
            package.port_num
        } else {
            self.config.default_port_num
        };
        let req = CreateHostRequest {
            line_id: plan.line_id,
            os,
            cpu: package.cores + spec.add_cores,
            memory_gb: package.memory_gb + spec.add_mem_gb,
            disk_gb: package.disk_gb + spec.add_disk_gb,
            bandwidth: package.bandwidth_mbps + spec.add_bw_mbps,
            expire_time: expire,
            host_name: host_name.clone(),
            sys_pwd: random_password(10),
            vnc_pwd: random_password(8),
            port_num,
            snapshot: 0,
            backups: 0,
        };
        let created = client.create_host(req.clone()).await;
        self.log_call(ctx, "create_host", &req, &created).await;
        let mut host_id = created?.host_id;

        if host_id == 0 {
            let found = client.list_host_simple(&host_name).await;
            self.log_call(ctx, "list_host_simple", &json!({ "search_tag": host_name }), &found)
                .await;
            host_id = found?
                .into_iter()
                .find(|h| h.host_name == host_name)
                .map(|h| h.id)
                .unwrap_or(0);
        }
        if host_id == 0 {
            return Err(Error::Unavailable(format!(
                "automation did not report a host id for {host_name}"
            )));
        }

        let access = AccessInfo {
            remote_ip: String::new(),
            panel_password: String::new(),
            vnc_password: req.vnc_pwd.clone(),
            os_password: req.sys_pwd.clone(),
        };
        let monthly_price = if item.duration_months > 0 {
            item.amount / item.duration_months as i64
        } else {
            item.amount
        };
        let mut vps = VpsInstance {
            id: 0,
            user_id: order.user_id,
            order_item_id: item.id,
            automation_instance_id: host_id.to_string(),
            goods_type_id: item.goods_type_id,
            package_id: package.id,
            package_name: package.name.clone(),
            name: host_name.clone(),
            region: plan.name.clone(),
            line_id: plan.line_id,
            system_id: item.system_id,
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk_gb: req.disk_gb,
            bandwidth_mbps: req.bandwidth,
            port_num,
            monthly_price,
            spec_json: serde_json::to_string(&spec)?,
            status: VpsStatus::Provisioning,
            automation_state: 0,
            admin_status: AdminStatus::Normal,
            expire_at: Some(expire),
            last_emergency_renew_at: None,
            access_info_json: serde_json::to_string(&access)?,
            panel_url_cache: String::new(),
            created_at: now,
            updated_at: now,
        };
        vps.set_current_period(now, expire);
        let vps = self.store.vps.create_instance(vps).await?;

        item.automation_instance_id = host_id.to_string();
        item.vps_id = Some(vps.id);
        self.store.orders.update_order_item(item).await?;

        job.host_id = host_id;
        job.host_name = host_name;
        self.store.provision_jobs.update_provision_job(job).await?;
        info!(order_id = order.id, item_id = item.id, host_id, vps_id = vps.id, "Host created");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resize tasks
    // ------------------------------------------------------------------

    /// Run due resize tasks. Returns how many were handled.
    pub async fn run_resize_tasks(&self) -> Result<usize> {
        self.run_resize_tasks_at(Utc::now()).await
    }

    pub async fn run_resize_tasks_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self
            .store
            .resize_tasks
            .list_due_resize_tasks(now, self.config.batch_size)
            .await?;
        let count = tasks.len();
        for task in tasks {
            let task_id = task.id;
            if let Err(e) = self.process_resize(task).await {
                error!(task_id, error = %e, "Resize task failed unexpectedly");
            }
        }
        Ok(count)
    }

    async fn process_resize(&self, mut task: ResizeTask) -> Result<()> {
        task.status = JobStatus::Running;
        self.store.resize_tasks.update_resize_task(&task).await?;

        let order = self.store.orders.get_order(task.order_id).await?;
        let mut item = self.store.orders.get_order_item(task.order_item_id).await?;
        match self.apply_resize(&order, &item, &task).await {
            Ok(()) => {
                task.status = JobStatus::Succeeded;
                task.last_error.clear();
                self.store.resize_tasks.update_resize_task(&task).await?;
                self.complete_item(&order, &mut item).await?;
                info!(task_id = task.id, vps_id = task.vps_id, "Resize applied");
                self.refresh_order_status(order.id).await?;
            }
            Err(e) => {
                task.attempts += 1;
                task.last_error = e.to_string();
                let permanent = matches!(e, Error::InvalidInput(_) | Error::NotFound(_));
                if permanent || task.attempts >= self.config.max_attempts {
                    task.status = JobStatus::Failed;
                    self.store.resize_tasks.update_resize_task(&task).await?;
                    error!(task_id = task.id, attempts = task.attempts, error = %e, "Resize task gave up");
                    self.fail_item(&order, &mut item, &task.last_error).await?;
                    self.refresh_order_status(order.id).await?;
                } else {
                    let delay = self.config.backoff_after(task.attempts);
                    task.status = JobStatus::Pending;
                    task.next_run_at = Utc::now() + to_chrono(delay);
                    self.store.resize_tasks.update_resize_task(&task).await?;
                    warn!(
                        task_id = task.id,
                        attempts = task.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Resize attempt failed, retrying"
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_resize(&self, order: &Order, item: &OrderItem, task: &ResizeTask) -> Result<()> {
        let spec: ResizeSpec = serde_json::from_str(&item.spec_json)?;
        let mut vps = self.store.vps.get_instance(task.vps_id).await?;
        let host_id = vps
            .host_id()
            .ok_or_else(|| Error::invalid(format!("vps {} has no automation host", vps.id)))?;
        if spec.disk_gb < vps.disk_gb {
            return Err(Error::invalid("disk cannot shrink"));
        }
        let client = self.client_for(vps.goods_type_id).await?;
        let ctx = CallContext {
            order_id: order.id,
            item_id: item.id,
        };
        let req = ElasticUpdateRequest {
            host_id,
            cpu: Some(spec.cpu),
            memory_gb: Some(spec.memory_gb),
            disk_gb: Some(spec.disk_gb),
            bandwidth: Some(spec.bandwidth_mbps),
            port_num: None,
        };
        let result = client.elastic_update(req.clone()).await;
        self.log_call(ctx, "elastic_update", &req, &result).await;
        result?;

        vps.cpu = spec.cpu;
        vps.memory_gb = spec.memory_gb;
        vps.disk_gb = spec.disk_gb;
        vps.bandwidth_mbps = spec.bandwidth_mbps;
        if let Some(package_id) = spec.target_package_id.filter(|id| *id > 0) {
            if let Ok(pkg) = self.store.catalog.get_package(package_id).await {
                vps.package_name = pkg.name;
            }
            vps.package_id = package_id;
        }
        if spec.monthly_price > 0 {
            vps.monthly_price = spec.monthly_price;
        }
        if let Some(target) = &spec.spec {
            let mut merged: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&vps.spec_json).unwrap_or_default();
            if let serde_json::Value::Object(fields) = serde_json::to_value(target)? {
                merged.extend(fields);
            }
            vps.spec_json = serde_json::Value::Object(merged).to_string();
        }

        let info = client.get_host_info(host_id).await;
        self.log_call(ctx, "get_host_info", &json!({ "host_id": host_id }), &info)
            .await;
        if let Ok(info) = &info {
            apply_host_info(&mut vps, info);
        }
        self.store.vps.update_instance(&vps).await?;

        if spec.refund_amount > 0 {
            let credited = self
                .wallet
                .credit_once(
                    vps.user_id,
                    spec.refund_amount,
                    refs::RESIZE_CREDIT,
                    order.id,
                    &format!("resize refund {}", order.order_no),
                )
                .await?;
            if credited {
                info!(order_id = order.id, amount = spec.refund_amount, "Resize refund credited");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watchdog and refresh
    // ------------------------------------------------------------------

    /// Re-queue or fail items of orders stuck in `provisioning`.
    pub async fn reconcile_provisioning(&self) -> Result<usize> {
        self.reconcile_provisioning_at(Utc::now()).await
    }

    pub async fn reconcile_provisioning_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let minutes = self
            .settings
            .get_i64(keys::PROVISION_WATCHDOG_MAX_MINUTES, DEFAULT_WATCHDOG_MINUTES)
            .await?
            .max(1);
        let cutoff = now - chrono::Duration::minutes(minutes);
        let orders = self
            .store
            .orders
            .list_stale_orders(OrderStatus::Provisioning, cutoff, self.config.batch_size)
            .await?;
        let mut touched = 0;
        for order in orders {
            let items = self.store.orders.list_order_items(order.id).await?;
            for mut item in items {
                if item.status != ItemStatus::Provisioning {
                    continue;
                }
                match self.watchdog_item(&order, &mut item, now).await {
                    Ok(()) => touched += 1,
                    Err(e) => warn!(order_id = order.id, item_id = item.id, error = %e, "Watchdog failed"),
                }
            }
            // Touch the order so the next scan waits another window.
            let order = self.refresh_order_status(order.id).await?;
            if order.status == OrderStatus::Provisioning {
                self.store.orders.update_order(&order).await?;
            }
        }
        Ok(touched)
    }

    async fn watchdog_item(&self, order: &Order, item: &mut OrderItem, now: DateTime<Utc>) -> Result<()> {
        match item.action {
            ItemAction::Create => {
                match self.store.provision_jobs.get_provision_job_by_item(item.id).await? {
                    Some(mut job) if job.status.is_open() && job.attempts + 1 < self.config.max_attempts => {
                        job.attempts += 1;
                        job.status = JobStatus::Pending;
                        job.next_run_at = now;
                        job.last_error = "provisioning watchdog retry".into();
                        self.store.provision_jobs.update_provision_job(&job).await?;
                        warn!(order_id = order.id, item_id = item.id, attempts = job.attempts, "Watchdog re-queued provisioning");
                        Ok(())
                    }
                    Some(mut job) => {
                        if job.status.is_open() {
                            job.status = JobStatus::Failed;
                            job.last_error = "provisioning timed out".into();
                            self.store.provision_jobs.update_provision_job(&job).await?;
                        }
                        self.fail_item(order, item, "provisioning timed out").await
                    }
                    None => self.fail_item(order, item, "provisioning job missing").await,
                }
            }
            ItemAction::Resize => {
                let spec: ResizeSpec = serde_json::from_str(&item.spec_json)?;
                if self.store.resize_tasks.has_pending_resize_task(spec.vps_id).await? {
                    return Ok(());
                }
                self.fail_item(order, item, "resize task missing").await
            }
            _ => Ok(()),
        }
    }

    /// Refresh status and resources of every instance from automation.
    /// Returns how many instances were refreshed.
    pub async fn refresh_all(&self, page_size: i64) -> Result<usize> {
        let page_size = if page_size <= 0 { 100 } else { page_size };
        let mut offset = 0;
        let mut refreshed = 0;
        loop {
            let page = self.store.vps.list_instances(page_size, offset).await?;
            if page.items.is_empty() {
                break;
            }
            offset += page.items.len() as i64;
            for vps in page.items {
                match self.refresh_instance(vps).await {
                    Ok(_) => refreshed += 1,
                    Err(e) => debug!(error = %e, "Instance refresh skipped"),
                }
            }
            if offset >= page.total {
                break;
            }
        }
        Ok(refreshed)
    }

    pub async fn refresh_instance(&self, mut vps: VpsInstance) -> Result<VpsInstance> {
        let host_id = vps
            .host_id()
            .ok_or_else(|| Error::invalid(format!("vps {} has no automation host", vps.id)))?;
        let client = self.client_for(vps.goods_type_id).await?;
        let info = client.get_host_info(host_id).await?;
        let locked_for_expiry = vps.status == VpsStatus::ExpiredLocked;
        apply_host_info(&mut vps, &info);
        if locked_for_expiry && vps.status == VpsStatus::Locked {
            vps.status = VpsStatus::ExpiredLocked;
        }
        self.store.vps.update_instance(&vps).await?;
        Ok(vps)
    }
}
