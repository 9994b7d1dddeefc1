//! Long-lived interactive CLI processes.
//!
//! Each worker wraps one instance of the language-model CLI running in its
//! interactive mode. Commands are framed with per-process markers so that
//! output boundaries can be found on an otherwise unframed terminal stream.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────┐
//!                      │  HTTP handler  │
//!                      └───────┬────────┘
//!                              │ acquire / release
//!                      ┌───────▼────────┐
//!                      │   WorkerPool   │
//!                      └───────┬────────┘
//!               ┌──────────────┼──────────────┐
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (CLI REPL)│  │ (CLI REPL)│  │ (CLI REPL)│
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Warm processes**: no per-request startup cost
//! - **FIFO fairness**: waiters are served in arrival order
//! - **Crash recovery**: dead workers are respawned in the background
//! - **Stale output rejection**: late output from a timed-out command is
//!   never attributed to the next one

mod pool;
mod proc;
mod process;
mod protocol;
mod signals;
mod spawn;

pub use pool::{PooledWorker, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
pub use process::{CommandStream, Worker, WorkerState};
pub use protocol::{CommandOutput, OutputFragment};
pub use spawn::WorkerSpec;
