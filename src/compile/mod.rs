//! Supervised compilation.
//!
//! ```text
//!   ghcc compile                       ghcc compile --internal-worker
//!  ┌──────────────┐  CompileRequest   ┌──────────────────────┐
//!  │  Supervisor  │ ───── stdin ────▶ │        Worker        │
//!  │  poll loop   │                   │  ElasticPool ─▶ make │
//!  │  collector   │ ◀──── stdout ──── │  one frame / result  │
//!  └──────────────┘  WorkerMessage    └──────────────────────┘
//! ```
//!
//! The worker leads its own process group. On timeout the supervisor kills
//! the worker's process tree. After every run it sweeps the group and each
//! descendant it saw while polling, so nothing the build spawned outlives
//! the call.

mod channel;
mod ipc;
mod proc;
pub(crate) mod proctree;
mod protocol;
mod signals;
mod supervisor;
pub mod worker;

pub use proc::WorkerCommand;
pub use supervisor::{RunOutcome, Supervisor, SupervisorConfig, SupervisorState};
pub use worker::run_worker_main;
