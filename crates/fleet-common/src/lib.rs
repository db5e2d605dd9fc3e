//! Wire types shared by the fleet hub and the agents that talk to it.
//!
//! Everything on a websocket is a [`Frame`]: a namespaced event name plus a JSON
//! payload. The payload shapes for each event live next to it here so device
//! agents and dashboards can depend on this crate without pulling in the server.

pub mod frame;
pub mod live;
pub mod pagination;

pub use frame::{
    DispatchInstruction, Frame, InstructionAck, PageChange, RoomRequest, RpcCommand, RpcResponse,
    events,
};
pub use live::LiveEntry;
pub use pagination::{DEFAULT_PAGE_SIZE, PaginationResult, paginate};
