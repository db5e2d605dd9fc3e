use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An update template: a declarative instruction plus the devices it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplate {
    pub id: String,
    pub name: String,
    pub target_device_ids: Vec<String>,
    /// Image and container stacks, delivered verbatim to every target.
    pub instruction: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when creating a template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub target_device_ids: Vec<String>,
    #[serde(default)]
    pub instruction: Value,
}

/// "Apply template X to device Y", tracked independently per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: i64,
    pub template_id: String,
    pub device_id: String,
    pub is_done: bool,
    /// Last failure reported by the device; the plan stays pending.
    pub last_error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Persisted summary of a device, refreshed on every state report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub last_seen: String,
    pub data: Value,
}
