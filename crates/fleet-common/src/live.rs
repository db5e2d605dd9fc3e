use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the published live device set: `id` is the device id and
/// `data` its last reported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEntry {
    pub id: String,
    pub data: Value,
    pub last_seen: DateTime<Utc>,
}
