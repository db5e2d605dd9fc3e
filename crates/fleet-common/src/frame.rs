use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names used on the `/devices` and `/clients` namespaces.
pub mod events {
    /// device → hub: full replacement of the device's last known state.
    pub const REPORT_STATE: &str = "report-state";
    /// hub → device: apply an update template.
    pub const DISPATCH_INSTRUCTION: &str = "dispatch-instruction";
    /// device → hub: the instruction for a template was applied (or failed).
    pub const INSTRUCTION_ACK: &str = "instruction-ack";
    /// observer → hub: navigate to another page of the device list.
    pub const PAGE_CHANGE: &str = "page-change";
    /// hub → observer: one page of live device state.
    pub const REALTIME_INFO: &str = "realtime-info";
    /// observer → hub: follow one device's state.
    pub const JOIN_ROOM: &str = "join-room";
    /// observer → hub: stop following a device.
    pub const LEAVE_ROOM: &str = "leave-room";
    /// hub → observer: current state of a followed device.
    pub const ROOM_INFO: &str = "room-info";
    /// observer → hub → device: run a command on one device.
    pub const RPC_COMMAND: &str = "rpc-command";
    /// device → hub → observer: outcome of an `rpc-command`.
    pub const RPC_RESPONSE: &str = "rpc-response";
    /// hub → any: the last inbound frame could not be handled.
    pub const ERROR: &str = "error";
}

/// A single JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            events::ERROR,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// Payload of `dispatch-instruction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchInstruction {
    pub template_id: String,
    pub plan_id: i64,
    /// Declarative image/container stacks, passed through untouched.
    pub instruction: Value,
}

/// Payload of `instruction-ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionAck {
    pub template_id: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Payload of `page-change`. Dashboards send either a bare page number or an
/// object that can also resize the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageChange {
    Page(i64),
    #[serde(rename_all = "camelCase")]
    Request {
        page: i64,
        #[serde(default)]
        page_size: Option<i64>,
    },
}

impl PageChange {
    pub fn page(&self) -> i64 {
        match self {
            Self::Page(page) | Self::Request { page, .. } => *page,
        }
    }

    pub fn page_size(&self) -> Option<i64> {
        match self {
            Self::Page(_) => None,
            Self::Request { page_size, .. } => *page_size,
        }
    }
}

/// Payload of `join-room` and `leave-room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub device_id: String,
}

/// Payload of `rpc-command`.
///
/// From an observer it names the target device; the hub strips `device_id`
/// and replaces `request_id` with its own before forwarding to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Payload of `rpc-response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn failed(request_id: impl Into<String>, device_id: &str, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            device_id: Some(device_id.to_string()),
            success: false,
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_without_data_defaults_to_null() {
        let frame: Frame = serde_json::from_str(r#"{"event":"report-state"}"#).unwrap();
        assert_eq!(frame.event, events::REPORT_STATE);
        assert!(frame.data.is_null());
    }

    #[test]
    fn test_instruction_ack_defaults_to_success() {
        let ack: InstructionAck = serde_json::from_str(r#"{"templateId":"t1"}"#).unwrap();
        assert_eq!(ack.template_id, "t1");
        assert!(ack.success);
        assert!(ack.error.is_none());
    }

    #[test]
    fn test_page_change_accepts_bare_number() {
        let change: PageChange = serde_json::from_str("3").unwrap();
        assert_eq!(change.page(), 3);
        assert_eq!(change.page_size(), None);
    }

    #[test]
    fn test_page_change_accepts_object_with_page_size() {
        let change: PageChange = serde_json::from_str(r#"{"page":0,"pageSize":5}"#).unwrap();
        assert_eq!(change.page(), 0);
        assert_eq!(change.page_size(), Some(5));
    }

    #[test]
    fn test_dispatch_instruction_uses_camel_case() {
        let msg = DispatchInstruction {
            template_id: "t1".to_string(),
            plan_id: 7,
            instruction: serde_json::json!({"imageStacks": []}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"templateId\":\"t1\""));
        assert!(json.contains("\"planId\":7"));
    }

    #[test]
    fn test_rpc_command_from_observer() {
        let cmd: RpcCommand =
            serde_json::from_str(r#"{"deviceId":"d1","requestId":"r1","command":"restart"}"#)
                .unwrap();
        assert_eq!(cmd.device_id.as_deref(), Some("d1"));
        assert_eq!(cmd.command, "restart");
        assert!(cmd.args.is_null());
    }

    #[test]
    fn test_rpc_response_defaults_to_success() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"requestId":"r1","result":{"uptime":5}}"#).unwrap();
        assert!(resp.success);
        assert_eq!(resp.result["uptime"], 5);
        assert!(resp.device_id.is_none());
    }
}
