//! Fleet hub: realtime coordination of device agents and dashboards.
//!
//! ## Overview
//!
//! Device agents hold a websocket on `/devices`, report their state and
//! receive update instructions. Dashboards hold a websocket on `/clients` and
//! get a paginated view of the live fleet pushed to them whenever it changes.
//! A dashboard can also follow single devices and relay RPC commands to them.
//! Operators trigger template runs over HTTP; the scheduler fans each run out
//! into one execution plan per device and completes plans as acknowledgments
//! come back.
//!
//! ## Module Map
//!
//! ```text
//! ┌───────────┐  ws /devices  ┌─────────────────────────────────────────────┐
//! │  Device   │ ────────────> │  ws.rs  (upgrade, socket loop, keepalive)   │
//! │  agents   │ <──────────── │    │                                        │
//! └───────────┘               │    │ PluginHandle::connect/message          │
//! ┌───────────┐  ws /clients  │    v                                        │
//! │ Dashboard │ ────────────> │  plugins/  (one tokio task per namespace)   │
//! │           │ <──────────── │    device.rs ── DevicesChanged ──> browser.rs│
//! └───────────┘               │       ^   │                                 │
//! ┌───────────┐     HTTP      │       │   │ DeviceAck                       │
//! │ Operator  │ ────────────> │  api.rs   v                                 │
//! └───────────┘               │    └─> scheduler.rs ──> store.rs (FleetStore)│
//! │                           │              Dispatch ─┘        │           │
//! │                           │                                 v           │
//! │                           │                        db.rs (SQLite)       │
//! │                           └─────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                              |
//! |-------------|-------------------------------------------------------------|
//! | `models`    | Stored records: `UpdateTemplate`, `ExecutionPlan`, devices  |
//! | `db`        | SQLite access via `DbHandle` (`Arc<Mutex<_>>` + blocking)   |
//! | `store`     | `FleetStore` trait the scheduler and API depend on          |
//! | `hub`       | `FleetHub`: composes plugins, scheduler and storage workers |
//! | `server`    | axum `Router`, `ServerConfig`, graceful shutdown            |
//!
//! ## Run Flow (`POST /api/v1/update-template/{id}/run`)
//!
//! 1. `api::run_template` hands the optional target override to
//!    `ExecutionPlanScheduler::run_template`, which stores it on the template.
//! 2. One plan per target is inserted; a failed insert is logged and the
//!    loop continues.
//! 3. Each plan becomes a `Signal::Dispatch` into the device plugin, which
//!    sends `dispatch-instruction` if the device is connected and answers
//!    "unreachable" otherwise. The HTTP call returns here.
//! 4. The device replies `instruction-ack`; the device plugin forwards it to
//!    the scheduler's listener, which marks the latest plan for that
//!    `(template, device)` pair done exactly once.

pub mod api;
pub mod db;
pub mod hub;
pub mod models;
pub mod plugins;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod ws;
