//! `/clients` namespace: dashboards watching a paginated view of live devices.
//!
//! Besides paging, an observer can follow individual devices (`join-room`)
//! to get their state pushed as it changes, and relay `rpc-command`s to a
//! followed device through the device namespace.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fleet_common::{
    Frame, LiveEntry, PageChange, RoomRequest, RpcCommand, RpcResponse, events, paginate,
};
use serde_json::{Value, json};
use tracing::debug;

use super::{
    Connection, ConnectionId, ConnectionRegistry, HandlerTable, Handshake, LiveSet, Plugin,
    PluginContext, RpcCall, Signal, decode, device,
};
use crate::errors::RealtimeError;

pub const NAME: &str = "clients";

#[derive(Debug, Clone)]
pub struct ObserverConnection {
    pub current_page: i64,
    pub page_size: i64,
    /// Device ids this observer follows.
    pub rooms: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
}

pub struct BrowserPlugin {
    client_token: Option<String>,
    default_page_size: i64,
    observers: ConnectionRegistry<ObserverConnection>,
    /// Device set of the previous broadcast, for room change detection.
    last_devices: LiveSet,
}

impl BrowserPlugin {
    pub fn new(client_token: Option<String>, default_page_size: i64) -> Self {
        Self {
            client_token,
            default_page_size,
            observers: ConnectionRegistry::new(),
            last_devices: LiveSet::default(),
        }
    }

    pub fn observer(&self, id: &ConnectionId) -> Option<&ObserverConnection> {
        self.observers.get(id)
    }

    /// Send every observer its own page of `devices`.
    pub fn broadcast_to_all(&self, ctx: &PluginContext<'_>, devices: &[LiveEntry]) {
        let sorted;
        let devices = if devices.is_sorted_by(|a, b| a.id <= b.id) {
            devices
        } else {
            let mut copy = devices.to_vec();
            copy.sort_by(|a, b| a.id.cmp(&b.id));
            sorted = copy;
            &sorted
        };
        for (id, observer) in self.observers.all() {
            send_page(ctx, id, observer, devices);
        }
    }

    /// Push `room-info` to followers of every device that changed since the
    /// previous set, including devices that went away.
    fn notify_rooms(&self, ctx: &PluginContext<'_>, devices: &[LiveEntry]) {
        let changed: BTreeSet<&str> = devices
            .iter()
            .filter(|entry| !self.last_devices.contains(entry))
            .map(|entry| entry.id.as_str())
            .chain(
                self.last_devices
                    .iter()
                    .filter(|old| !devices.iter().any(|entry| entry.id == old.id))
                    .map(|old| old.id.as_str()),
            )
            .collect();
        if changed.is_empty() {
            return;
        }
        for (id, observer) in self.observers.all() {
            for device_id in observer.rooms.iter().filter(|room| changed.contains(room.as_str())) {
                send_room_info(ctx, id, device_id, devices);
            }
        }
    }

    fn devices(ctx: &PluginContext<'_>) -> LiveSet {
        match ctx.sibling(device::NAME) {
            Ok(devices) => devices.live(),
            Err(err) => {
                debug!("{}", err);
                LiveSet::default()
            }
        }
    }

    fn page_change(
        &mut self,
        ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let change: PageChange = decode(events::PAGE_CHANGE, data)?;
        let Some(observer) = self.observers.get_mut(id) else {
            return Ok(());
        };
        observer.current_page = change.page();
        if let Some(size) = change.page_size().filter(|size| *size > 0) {
            observer.page_size = size;
        }
        observer.last_seen = Utc::now();
        debug!(connection = %id, page = observer.current_page, page_size = observer.page_size, "page changed");

        let devices = Self::devices(ctx);
        if let Some(observer) = self.observers.get(id) {
            send_page(ctx, id, observer, &devices);
        }
        Ok(())
    }

    fn join_room(
        &mut self,
        ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let RoomRequest { device_id } = decode(events::JOIN_ROOM, data)?;
        if device_id.is_empty() {
            return Err(RealtimeError::InvalidRequest {
                event: events::JOIN_ROOM,
                reason: "deviceId must not be empty".to_string(),
            });
        }
        let Some(observer) = self.observers.get_mut(id) else {
            return Ok(());
        };
        observer.last_seen = Utc::now();
        observer.rooms.insert(device_id.clone());
        debug!(connection = %id, device_id = %device_id, "joined device room");
        send_room_info(ctx, id, &device_id, &Self::devices(ctx));
        Ok(())
    }

    fn leave_room(
        &mut self,
        _ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let RoomRequest { device_id } = decode(events::LEAVE_ROOM, data)?;
        if let Some(observer) = self.observers.get_mut(id) {
            observer.last_seen = Utc::now();
            observer.rooms.remove(&device_id);
        }
        Ok(())
    }

    fn rpc_command(
        &mut self,
        ctx: &mut PluginContext<'_>,
        id: &ConnectionId,
        data: Value,
    ) -> Result<(), RealtimeError> {
        let command: RpcCommand = decode(events::RPC_COMMAND, data)?;
        let Some(device_id) = command.device_id.filter(|d| !d.is_empty()) else {
            return Err(RealtimeError::InvalidRequest {
                event: events::RPC_COMMAND,
                reason: "deviceId is required".to_string(),
            });
        };
        let Some(observer) = self.observers.get_mut(id) else {
            return Ok(());
        };
        if !observer.rooms.contains(&device_id) {
            return Err(RealtimeError::InvalidRequest {
                event: events::RPC_COMMAND,
                reason: format!("join-room {} first", device_id),
            });
        }
        observer.last_seen = Utc::now();

        let request_id = command
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let call = RpcCall {
            observer: id.clone(),
            request_id: request_id.clone(),
            device_id: device_id.clone(),
            command: command.command,
            args: command.args,
        };
        let relayed = ctx
            .sibling(device::NAME)
            .and_then(|devices| devices.signal(Signal::Rpc(call)));
        if let Err(err) = relayed {
            debug!(connection = %id, "{}", err);
            let response = RpcResponse::failed(request_id, &device_id, err.to_string());
            send_rpc_response(ctx, id, &response);
        }
        Ok(())
    }
}

fn send_page(
    ctx: &PluginContext<'_>,
    id: &ConnectionId,
    observer: &ObserverConnection,
    devices: &[LiveEntry],
) {
    let page = paginate(devices, observer.current_page, observer.page_size);
    match serde_json::to_value(&page) {
        Ok(data) => {
            ctx.emit(id, Frame::new(events::REALTIME_INFO, data));
        }
        Err(err) => debug!(connection = %id, "failed to encode page: {}", err),
    }
}

/// `room-info` for one followed device; `device` is null while it is offline.
fn send_room_info(ctx: &PluginContext<'_>, id: &ConnectionId, device_id: &str, devices: &[LiveEntry]) {
    let entry = devices.iter().find(|entry| entry.id == device_id);
    let data = json!({
        "deviceId": device_id,
        "online": entry.is_some(),
        "device": entry,
    });
    ctx.emit(id, Frame::new(events::ROOM_INFO, data));
}

fn send_rpc_response(ctx: &PluginContext<'_>, id: &ConnectionId, response: &RpcResponse) {
    match serde_json::to_value(response) {
        Ok(data) => {
            if !ctx.emit(id, Frame::new(events::RPC_RESPONSE, data)) {
                debug!(connection = %id, request_id = %response.request_id, "observer gone before rpc response");
            }
        }
        Err(err) => debug!(connection = %id, "failed to encode rpc response: {}", err),
    }
}

impl Plugin for BrowserPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn authenticate(&self, handshake: &Handshake) -> bool {
        matches!(
            (&self.client_token, &handshake.token),
            (Some(expected), Some(given)) if expected == given
        )
    }

    fn on_authenticated(
        &mut self,
        ctx: &mut PluginContext<'_>,
        connection: &Connection,
        _handshake: &Handshake,
    ) {
        let observer = ObserverConnection {
            current_page: 0,
            page_size: self.default_page_size,
            rooms: BTreeSet::new(),
            last_seen: Utc::now(),
        };
        send_page(ctx, connection.id(), &observer, &Self::devices(ctx));
        self.observers.register(connection.id().clone(), observer);
    }

    fn on_disconnect(&mut self, _ctx: &mut PluginContext<'_>, id: &ConnectionId) {
        self.observers.unregister(id);
    }

    fn on_signal(&mut self, ctx: &mut PluginContext<'_>, signal: Signal) {
        match signal {
            Signal::DevicesChanged(devices) => {
                self.broadcast_to_all(ctx, &devices);
                self.notify_rooms(ctx, &devices);
                self.last_devices = devices;
            }
            Signal::RpcResult { observer, response } => {
                send_rpc_response(ctx, &observer, &response);
            }
            Signal::Dispatch {
                device_id, reply, ..
            } => {
                let _ = reply.send(Err(RealtimeError::DeviceUnreachable { device_id }));
            }
            Signal::Rpc(call) => {
                debug!(device_id = %call.device_id, "rpc addressed to the observer namespace dropped");
            }
        }
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
            .on(events::PAGE_CHANGE, Self::page_change)
            .on(events::JOIN_ROOM, Self::join_room)
            .on(events::LEAVE_ROOM, Self::leave_room)
            .on(events::RPC_COMMAND, Self::rpc_command)
    }

    fn on_shutdown(&mut self) {
        let _ = self.observers.drain().count();
        self.last_devices = LiveSet::default();
    }
}
