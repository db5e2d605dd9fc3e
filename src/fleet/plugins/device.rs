//! `/devices` namespace: device agents report state and receive instructions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleet_common::{Frame, InstructionAck, LiveEntry, RpcCommand, RpcResponse, events};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Connection, ConnectionId, ConnectionRegistry, HandlerTable, Handshake, Plugin, PluginContext,
    RpcCall, Signal, browser, decode,
};
use crate::errors::RealtimeError;
use crate::fleet::models::DeviceRecord;

pub const NAME: &str = "devices";

#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub device_id: String,
    /// Replaced wholesale by each report, never merged.
    pub last_known_state: Value,
    pub last_seen: DateTime<Utc>,
}

/// An `instruction-ack` tagged with the device that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAck {
    pub device_id: String,
    pub ack: InstructionAck,
}

/// An `rpc-command` delivered to a device and not yet answered.
#[derive(Debug, Clone)]
struct PendingRpc {
    connection: ConnectionId,
    device_id: String,
    observer: ConnectionId,
    request_id: String,
}

pub struct DevicePlugin {
    device_token: Option<String>,
    devices: ConnectionRegistry<DeviceConnection>,
    by_device: HashMap<String, ConnectionId>,
    /// Keyed by the request id the device sees, not the observer's.
    rpcs: HashMap<String, PendingRpc>,
    acks: Option<mpsc::UnboundedSender<DeviceAck>>,
    records: Option<mpsc::UnboundedSender<DeviceRecord>>,
}

impl DevicePlugin {
    /// `device_token` is the fleet-wide pre-shared secret; `None` admits nobody.
    pub fn new(device_token: Option<String>) -> Self {
        Self {
            device_token,
            devices: ConnectionRegistry::new(),
            by_device: HashMap::new(),
            rpcs: HashMap::new(),
            acks: None,
            records: None,
        }
    }

    /// Forward instruction acknowledgments to the scheduler.
    pub fn with_ack_sink(mut self, acks: mpsc::UnboundedSender<DeviceAck>) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Queue a device record for persistence on every state report.
    pub fn with_record_sink(mut self, records: mpsc::UnboundedSender<DeviceRecord>) -> Self {
        self.records = Some(records);
        self
    }

    /// Live devices ordered by device id.
    pub fn snapshot(&self) -> Vec<LiveEntry> {
        let mut entries: Vec<LiveEntry> = self
            .devices
            .all()
            .map(|(_, device)| LiveEntry {
                id: device.device_id.clone(),
                data: device.last_known_state.clone(),
                last_seen: device.last_seen,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn connection_for(&self, device_id: &str) -> Option<&ConnectionId> {
        self.by_device.get(device_id)
    }

    /// Publish the device set and push it to the observer namespace.
    fn publish_and_notify(&self, ctx: &mut PluginContext<'_>) {
        let set = ctx.publish(self.snapshot());
        match ctx.sibling(browser::NAME) {
            Ok(observers) => {
                if let Err(err) = observers.signal(Signal::DevicesChanged(set)) {
                    debug!("{}", err);
                }
            }
            Err(err) => debug!("{}", err),
        }
    }

    fn answer_observer(ctx: &PluginContext<'_>, observer: ConnectionId, response: RpcResponse) {
        match ctx.sibling(browser::NAME) {
            Ok(observers) => {
                if let Err(err) = observers.signal(Signal::RpcResult { observer, response }) {
                    debug!("{}", err);
                }
            }
            Err(err) => debug!("{}", err),
        }
    }

    fn relay_rpc(&mut self, ctx: &PluginContext<'_>, call: RpcCall) {
        let RpcCall {
            observer,
            request_id,
            device_id,
            command,
            args,
        } = call;
        let Some(connection) = self.by_device.get(&device_id).cloned() else {
            let reason = RealtimeError::DeviceUnreachable {
                device_id: device_id.clone(),
            };
            Self::answer_observer(
                ctx,
                observer,
                RpcResponse::failed(request_id, &device_id, reason.to_string()),
            );
            return;
        };

        let device_request_id = uuid::Uuid::new_v4().to_string();
        let forward = RpcCommand {
            device_id: None,
            request_id: Some(device_request_id.clone()),
            command,
            args,
        };
        let delivered = serde_json::to_value(&forward)
            .is_ok_and(|data| ctx.emit(&connection, Frame::new(events::RPC_COMMAND, data)));
        if !delivered {
            let reason = RealtimeError::DeviceUnreachable {
                device_id: device_id.clone(),
            };
            Self::answer_observer(
                ctx,
                observer,
                RpcResponse::failed(request_id, &device_id, reason.to_string()),
            );
            return;
        }

        debug!(device_id = %device_id, command = %forward.command, "rpc command relayed");
        self.rpcs.insert(
            device_request_id,
            PendingRpc {
                connection,
                device_id,
                observer,
                request_id,
            },
        );
    }

    /// Fail every command still waiting on `connection`.
    fn abandon_rpcs(&mut self, ctx: &PluginContext<'_>, connection: &ConnectionId) {
        let abandoned: Vec<String> = self
            .rpcs
            .iter()
            .filter(|(_, pending)| pending.connection == *connection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in abandoned {
            if let Some(pending) = self.rpcs.remove(&key) {
                let reason = format!("Device {} disconnected before answering", pending.device_id);
                Self::answer_observer(
                    ctx,
                    pending.observer,
                    RpcResponse::failed(pending.request_id, &pending.device_id, reason),
                );
            }
        }
    }

    fn rpc_response(
        &mut self,
        ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let mut response: RpcResponse = decode(events::RPC_RESPONSE, data)?;
        let owned = self
            .rpcs
            .get(&response.request_id)
            .is_some_and(|pending| pending.connection == *id);
        let pending = if owned {
            self.rpcs.remove(&response.request_id)
        } else {
            None
        };
        let Some(pending) = pending else {
            debug!(connection = %id, request_id = %response.request_id, "rpc response without a pending command ignored");
            return Ok(());
        };

        if let Some(device) = self.devices.get_mut(id) {
            device.last_seen = Utc::now();
        }
        response.request_id = pending.request_id;
        response.device_id = Some(pending.device_id);
        Self::answer_observer(ctx, pending.observer, response);
        Ok(())
    }

    fn report_state(
        &mut self,
        ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let Some(device) = self.devices.get_mut(id) else {
            return Ok(());
        };
        device.last_known_state = data;
        device.last_seen = Utc::now();
        debug!(device_id = %device.device_id, "state reported");

        if let Some(records) = &self.records {
            let record = DeviceRecord {
                device_id: device.device_id.clone(),
                last_seen: device.last_seen.to_rfc3339(),
                data: device.last_known_state.clone(),
            };
            if records.send(record).is_err() {
                debug!("device record writer has stopped");
            }
        }

        self.publish_and_notify(ctx);
        Ok(())
    }

    fn instruction_ack(
        &mut self,
        _ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let ack: InstructionAck = decode(events::INSTRUCTION_ACK, data)?;
        let Some(device) = self.devices.get_mut(id) else {
            return Ok(());
        };
        device.last_seen = Utc::now();
        let device_id = device.device_id.clone();
        info!(
            device_id = %device_id,
            template_id = %ack.template_id,
            success = ack.success,
            "instruction acknowledged"
        );
        match &self.acks {
            Some(acks) => {
                if acks.send(DeviceAck { device_id, ack }).is_err() {
                    warn!("scheduler is not listening for acknowledgments");
                }
            }
            None => debug!("no acknowledgment sink configured"),
        }
        Ok(())
    }

    fn dispatch(
        &self,
        ctx: &PluginContext<'_>,
        device_id: String,
        instruction: fleet_common::DispatchInstruction,
    ) -> Result<(), RealtimeError> {
        let Some(id) = self.by_device.get(&device_id) else {
            return Err(RealtimeError::DeviceUnreachable { device_id });
        };
        let data = serde_json::to_value(&instruction).map_err(|source| {
            RealtimeError::MalformedPayload {
                event: events::DISPATCH_INSTRUCTION.to_string(),
                source,
            }
        })?;
        if ctx.emit(id, Frame::new(events::DISPATCH_INSTRUCTION, data)) {
            debug!(device_id = %device_id, template_id = %instruction.template_id, "instruction dispatched");
            Ok(())
        } else {
            Err(RealtimeError::DeviceUnreachable { device_id })
        }
    }
}

impl Plugin for DevicePlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn authenticate(&self, handshake: &Handshake) -> bool {
        let token_ok = match (&self.device_token, &handshake.token) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        };
        let has_identity = handshake
            .device_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        token_ok && has_identity
    }

    fn on_authenticated(
        &mut self,
        ctx: &mut PluginContext<'_>,
        connection: &Connection,
        handshake: &Handshake,
    ) {
        let Some(device_id) = handshake.device_id.clone() else {
            ctx.close(connection.id());
            return;
        };

        if let Some(previous) = self
            .by_device
            .insert(device_id.clone(), connection.id().clone())
            && previous != *connection.id()
        {
            info!(device_id = %device_id, stale = %previous, "device reconnected, closing stale connection");
            self.devices.unregister(&previous);
            ctx.close(&previous);
            self.abandon_rpcs(ctx, &previous);
        }

        self.devices.register(
            connection.id().clone(),
            DeviceConnection {
                device_id,
                last_known_state: Value::Null,
                last_seen: Utc::now(),
            },
        );
        self.publish_and_notify(ctx);
    }

    fn on_disconnect(&mut self, ctx: &mut PluginContext<'_>, id: &ConnectionId) {
        let Some(device) = self.devices.unregister(id) else {
            return;
        };
        if self.by_device.get(&device.device_id) == Some(id) {
            self.by_device.remove(&device.device_id);
        }
        self.abandon_rpcs(ctx, id);
        info!(device_id = %device.device_id, "device disconnected");
        self.publish_and_notify(ctx);
    }

    fn on_signal(&mut self, ctx: &mut PluginContext<'_>, signal: Signal) {
        match signal {
            Signal::Dispatch {
                device_id,
                instruction,
                reply,
            } => {
                let verdict = self.dispatch(ctx, device_id, instruction);
                let _ = reply.send(verdict);
            }
            Signal::Rpc(call) => self.relay_rpc(ctx, call),
            Signal::DevicesChanged(_) | Signal::RpcResult { .. } => {}
        }
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
            .on(events::REPORT_STATE, Self::report_state)
            .on(events::INSTRUCTION_ACK, Self::instruction_ack)
            .on(events::RPC_RESPONSE, Self::rpc_response)
    }

    fn on_shutdown(&mut self) {
        let _ = self.devices.drain().count();
        self.by_device.clear();
        self.rpcs.clear();
    }
}
