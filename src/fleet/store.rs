use anyhow::Result;
use async_trait::async_trait;

use super::db::DbHandle;
use super::models::{DeviceRecord, ExecutionPlan, NewTemplate, UpdateTemplate};

/// Storage collaborator for the scheduler and the HTTP layer.
/// Real implementation: `DbHandle` (SQLite). Tests wrap it to inject failures.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn create_template(&self, new: NewTemplate) -> Result<UpdateTemplate>;

    async fn get_template(&self, id: &str) -> Result<Option<UpdateTemplate>>;

    async fn set_template_targets(&self, id: &str, targets: Vec<String>) -> Result<UpdateTemplate>;

    async fn create_plan(&self, template_id: &str, device_id: &str) -> Result<ExecutionPlan>;

    /// Returns `true` only for the call that actually flipped the plan.
    async fn mark_plan_done(&self, plan_id: i64) -> Result<bool>;

    async fn record_plan_error(&self, plan_id: i64, error: &str) -> Result<()>;

    async fn latest_plan(&self, template_id: &str, device_id: &str)
    -> Result<Option<ExecutionPlan>>;

    async fn list_plans(&self, template_id: &str) -> Result<Vec<ExecutionPlan>>;

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()>;

    /// Stored device records ordered by device id.
    async fn device_summaries(&self) -> Result<Vec<DeviceRecord>>;
}

#[async_trait]
impl FleetStore for DbHandle {
    async fn create_template(&self, new: NewTemplate) -> Result<UpdateTemplate> {
        self.call(move |db| db.create_template(&new)).await
    }

    async fn get_template(&self, id: &str) -> Result<Option<UpdateTemplate>> {
        let id = id.to_string();
        self.call(move |db| db.get_template(&id)).await
    }

    async fn set_template_targets(&self, id: &str, targets: Vec<String>) -> Result<UpdateTemplate> {
        let id = id.to_string();
        self.call(move |db| db.set_template_targets(&id, &targets))
            .await
    }

    async fn create_plan(&self, template_id: &str, device_id: &str) -> Result<ExecutionPlan> {
        let (template_id, device_id) = (template_id.to_string(), device_id.to_string());
        self.call(move |db| db.create_plan(&template_id, &device_id))
            .await
    }

    async fn mark_plan_done(&self, plan_id: i64) -> Result<bool> {
        self.call(move |db| db.mark_plan_done(plan_id)).await
    }

    async fn record_plan_error(&self, plan_id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        self.call(move |db| db.record_plan_error(plan_id, &error))
            .await
    }

    async fn latest_plan(
        &self,
        template_id: &str,
        device_id: &str,
    ) -> Result<Option<ExecutionPlan>> {
        let (template_id, device_id) = (template_id.to_string(), device_id.to_string());
        self.call(move |db| db.latest_plan(&template_id, &device_id))
            .await
    }

    async fn list_plans(&self, template_id: &str) -> Result<Vec<ExecutionPlan>> {
        let template_id = template_id.to_string();
        self.call(move |db| db.list_plans(&template_id)).await
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()> {
        self.call(move |db| db.upsert_device(&record)).await
    }

    async fn device_summaries(&self) -> Result<Vec<DeviceRecord>> {
        self.call(|db| db.list_devices()).await
    }
}
