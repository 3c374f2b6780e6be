//! Asynchronous subprocess backend for Windows.
//!
//! One worker thread multiplexes overlapped pipe I/O, job-object exit
//! notifications, and wake-ups from the controlling thread through a single
//! I/O completion port. See [`worker::WorkerHandle`] for the entry point.

pub mod command;
pub mod completion;
pub mod config;
pub mod error;
pub mod key;
pub mod pipe;
pub mod process;
pub mod registry;
pub mod sys;
pub mod worker;

use std::sync::OnceLock;

pub use completion::{Promise, Resolver, Settled, promise};
pub use config::WorkerConfig;
pub use error::SubprocessError;
pub use key::{CompletionTarget, PipeId, ProcessId};
pub use pipe::Direction;
pub use process::{SpawnOptions, StderrMode};
pub use registry::{IoRegistry, ProcessInfo, SpawnedProcess};
pub use sys::Sys;
pub use worker::{Request, Response, ResponseData, WorkerHandle};

#[cfg(windows)]
pub use sys::windows::WindowsSys;

pub(crate) fn trace_subprocess() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("MOLT_TRACE_SUBPROCESS").as_deref() == Ok("1"))
}

/// Starts a worker on the real completion port, configured from the
/// environment.
#[cfg(windows)]
pub fn start_worker() -> std::io::Result<WorkerHandle<WindowsSys>> {
    WorkerHandle::start(WindowsSys, WorkerConfig::from_env())
}
