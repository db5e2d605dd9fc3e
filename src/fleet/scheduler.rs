//! Execution plan scheduler.
//!
//! A run fans one update template out to N devices: one plan record per
//! device, one `dispatch-instruction` per live device. Completion is driven
//! later by device acknowledgments and never awaited here.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_common::DispatchInstruction;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::models::{ExecutionPlan, UpdateTemplate};
use super::plugins::PluginHandle;
use super::plugins::device::DeviceAck;
use super::store::FleetStore;
use crate::errors::{RealtimeError, SchedulerError};

/// Outcome of one run: the plans created and where each dispatch went.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub template_id: String,
    pub plans: Vec<ExecutionPlan>,
    pub dispatched: Vec<String>,
    /// Devices with a plan that were not connected; their plans stay pending.
    pub unreachable: Vec<String>,
}

pub struct ExecutionPlanScheduler {
    store: Arc<dyn FleetStore>,
    devices: PluginHandle,
}

impl ExecutionPlanScheduler {
    /// `devices` must be the handle of the device namespace plugin.
    pub fn new(store: Arc<dyn FleetStore>, devices: PluginHandle) -> Self {
        Self { store, devices }
    }

    /// Create and dispatch plans for `targets` using the stored instruction
    /// of `template_id`.
    pub async fn run(
        &self,
        template_id: &str,
        targets: &[String],
    ) -> Result<RunReport, SchedulerError> {
        if targets.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "targetDeviceIds must not be empty".to_string(),
            ));
        }
        let template = self.load_template(template_id).await?;
        self.execute(&template, targets).await
    }

    /// Run a stored template. `targets`, when given, first replaces the
    /// template's stored target list.
    pub async fn run_template(
        &self,
        template_id: &str,
        targets: Option<Vec<String>>,
    ) -> Result<RunReport, SchedulerError> {
        let mut template = self.load_template(template_id).await?;
        if let Some(targets) = targets {
            if targets.is_empty() {
                return Err(SchedulerError::InvalidRequest(
                    "targetDeviceIds must not be empty".to_string(),
                ));
            }
            template = self
                .store
                .set_template_targets(&template.id, targets)
                .await
                .map_err(SchedulerError::Storage)?;
        }
        if template.target_device_ids.is_empty() {
            return Err(SchedulerError::InvalidRequest(format!(
                "template {} has no target devices",
                template.id
            )));
        }
        let targets = template.target_device_ids.clone();
        self.execute(&template, &targets).await
    }

    /// Apply one device acknowledgment to its plan.
    ///
    /// Returns `true` only when this call moved the plan to done. An
    /// acknowledgment for a done plan, or for no plan at all, is a no-op.
    pub async fn complete(&self, ack: &DeviceAck) -> Result<bool, SchedulerError> {
        let template_id = &ack.ack.template_id;
        let Some(plan) = self
            .store
            .latest_plan(template_id, &ack.device_id)
            .await
            .map_err(SchedulerError::Storage)?
        else {
            debug!(device_id = %ack.device_id, template_id = %template_id, "acknowledgment without a plan ignored");
            return Ok(false);
        };
        if plan.is_done {
            debug!(plan_id = plan.id, "plan already done");
            return Ok(false);
        }

        if ack.ack.success {
            let flipped = self
                .store
                .mark_plan_done(plan.id)
                .await
                .map_err(SchedulerError::Storage)?;
            if flipped {
                info!(plan_id = plan.id, device_id = %ack.device_id, template_id = %template_id, "plan done");
            }
            Ok(flipped)
        } else {
            let reason = ack
                .ack
                .error
                .clone()
                .unwrap_or_else(|| "device reported failure".to_string());
            warn!(plan_id = plan.id, device_id = %ack.device_id, template_id = %template_id, "plan failed on device: {}", reason);
            self.store
                .record_plan_error(plan.id, &reason)
                .await
                .map_err(SchedulerError::Storage)?;
            Ok(false)
        }
    }

    /// Plans of a template ordered by creation.
    pub async fn get_plans(&self, template_id: &str) -> Result<Vec<ExecutionPlan>, SchedulerError> {
        self.store
            .list_plans(template_id)
            .await
            .map_err(SchedulerError::Storage)
    }

    /// Drain acknowledgments from the device namespace until it goes away.
    pub fn spawn_ack_listener(
        self: Arc<Self>,
        mut acks: mpsc::UnboundedReceiver<DeviceAck>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(ack) = acks.recv().await {
                if let Err(e) = self.complete(&ack).await {
                    error!(device_id = %ack.device_id, template_id = %ack.ack.template_id, "failed to record acknowledgment: {}", e);
                }
            }
            debug!("acknowledgment listener stopped");
        })
    }

    async fn load_template(&self, template_id: &str) -> Result<UpdateTemplate, SchedulerError> {
        self.store
            .get_template(template_id)
            .await
            .map_err(SchedulerError::Storage)?
            .ok_or_else(|| SchedulerError::TemplateNotFound {
                id: template_id.to_string(),
            })
    }

    async fn execute(
        &self,
        template: &UpdateTemplate,
        targets: &[String],
    ) -> Result<RunReport, SchedulerError> {
        let mut seen = HashSet::new();
        let targets: Vec<&String> = targets.iter().filter(|id| seen.insert(*id)).collect();

        let mut plans = Vec::with_capacity(targets.len());
        let mut failed = 0;
        let mut first_error = None;
        for device_id in &targets {
            match self.store.create_plan(&template.id, device_id).await {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    warn!(device_id = %device_id, template_id = %template.id, "failed to create plan: {:#}", e);
                    failed += 1;
                    first_error.get_or_insert_with(|| format!("{:#}", e));
                }
            }
        }

        let mut dispatched = Vec::new();
        let mut unreachable = Vec::new();
        for plan in &plans {
            let instruction = DispatchInstruction {
                template_id: template.id.clone(),
                plan_id: plan.id,
                instruction: template.instruction.clone(),
            };
            match self.devices.dispatch(&plan.device_id, instruction).await {
                Ok(()) => dispatched.push(plan.device_id.clone()),
                Err(RealtimeError::DeviceUnreachable { device_id }) => {
                    info!(device_id = %device_id, plan_id = plan.id, "device not connected, plan left pending");
                    unreachable.push(device_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            template_id = %template.id,
            plans = plans.len(),
            dispatched = dispatched.len(),
            unreachable = unreachable.len(),
            "template run dispatched"
        );

        if let Some(first_error) = first_error {
            return Err(SchedulerError::PartialStorageFailure {
                failed,
                attempted: targets.len(),
                first_error,
            });
        }

        Ok(RunReport {
            template_id: template.id.clone(),
            plans,
            dispatched,
            unreachable,
        })
    }
}
