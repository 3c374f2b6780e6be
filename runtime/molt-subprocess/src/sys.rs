//! The operating-system surface used by pipes, processes, and the registry.
//!
//! Everything above this module talks to the OS through [`Sys`], so the
//! state machines can run against the real completion port on Windows and
//! against a scripted port in unit tests.

use crate::pipe::Direction;
use std::io;
use std::time::Duration;

#[cfg(windows)]
pub mod windows;

#[cfg(test)]
pub mod fake;

/// Exit code handed to `TerminateJobObject` / `TerminateProcess`.
pub const TERMINATE_EXIT_CODE: u32 = 0x7f;
/// Exit code reported for a process this worker killed.
pub const KILLED_EXIT_CODE: i64 = -9;
pub const STILL_ACTIVE: u32 = 259;

pub const ERROR_FILE_NOT_FOUND: i32 = 2;
pub const ERROR_PATH_NOT_FOUND: i32 = 3;
pub const ERROR_BROKEN_PIPE: i32 = 109;
pub const ERROR_BAD_EXE_FORMAT: i32 = 193;
pub const ERROR_ABANDONED_WAIT_0: i32 = 735;
pub const ERROR_OPERATION_ABORTED: i32 = 995;
pub const ERROR_IO_INCOMPLETE: i32 = 996;
pub const ERROR_IO_PENDING: i32 = 997;
pub const WAIT_TIMEOUT: i32 = 258;

pub const JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO: u32 = 4;
pub const JOB_OBJECT_MSG_NEW_PROCESS: u32 = 6;
pub const JOB_OBJECT_MSG_EXIT_PROCESS: u32 = 7;
pub const JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS: u32 = 8;

/// One packet taken off the completion port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub key: usize,
    /// Bytes transferred for I/O packets, the `JOB_OBJECT_MSG_*` id for job
    /// packets.
    pub bytes: u32,
    /// The overlapped pointer for I/O packets, the OS pid for job exit
    /// packets.
    pub overlapped: usize,
    /// Set when the dequeue call itself failed for this packet.
    pub error: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dequeued {
    Packet(Completion),
    Timeout,
    /// The port was closed underneath the worker.
    PortClosed,
    /// The wait failed without producing a packet.
    Failed(i32),
}

/// Both ends of a freshly created pipe.
pub struct PipePair<H> {
    /// Opened for overlapped I/O.
    pub ours: H,
    /// Synchronous and inheritable; handed to the child.
    pub theirs: H,
}

pub struct ProcessRequest<'a, H> {
    pub application: &'a str,
    pub command_line: &'a str,
    /// NUL separated, double-NUL terminated UTF-16.
    pub environment: &'a [u16],
    pub workdir: Option<&'a str>,
    pub stdin: &'a H,
    pub stdout: &'a H,
    pub stderr: Option<&'a H>,
}

pub struct ChildProcess<H> {
    pub process: H,
    /// Primary thread, still suspended.
    pub thread: H,
    pub pid: u32,
}

pub trait Sys {
    /// Owned OS handle, released exactly once when dropped.
    type Handle;
    /// Per-pipe overlapped record. Its address must stay fixed while an
    /// operation is in flight.
    type Overlapped;
    /// Borrowed completion port reference; the port itself is owned by
    /// whoever created it.
    type Port: Copy + Send + 'static;

    fn create_completion_port(&self) -> io::Result<Self::Handle>;
    fn port_ref(&self, port: &Self::Handle) -> Self::Port;
    fn post_wake(&self, port: Self::Port) -> io::Result<()>;
    fn dequeue(&self, port: Self::Port, timeout: Duration) -> Dequeued;

    fn associate(&self, port: Self::Port, handle: &Self::Handle, key: usize) -> io::Result<()>;
    fn duplicate(&self, handle: &Self::Handle, inheritable: bool) -> io::Result<Self::Handle>;

    /// `Direction::Input` gives a pipe the worker reads from; the child's end
    /// is the write end.
    fn create_pipe(&self, direction: Direction) -> io::Result<PipePair<Self::Handle>>;
    /// Inheritable duplicate of the worker's own stderr, `None` if there is
    /// none.
    fn inherited_stderr(&self) -> io::Result<Option<Self::Handle>>;

    fn new_overlapped(&self) -> Box<Self::Overlapped>;

    /// Starts an overlapped read. `Ok(true)` means the read finished right
    /// away; a completion packet is queued either way.
    ///
    /// # Safety
    ///
    /// `overlapped` and the `len` bytes at `buf` must stay valid and unmoved
    /// until the operation completes, or is cancelled and its result
    /// collected with `overlapped_result(.., wait = true)`.
    unsafe fn start_read(
        &self,
        handle: &Self::Handle,
        overlapped: &Self::Overlapped,
        buf: *mut u8,
        len: u32,
    ) -> io::Result<bool>;

    /// Overlapped counterpart of [`Sys::start_read`] for writes.
    ///
    /// # Safety
    ///
    /// Same contract as [`Sys::start_read`].
    unsafe fn start_write(
        &self,
        handle: &Self::Handle,
        overlapped: &Self::Overlapped,
        buf: *const u8,
        len: u32,
    ) -> io::Result<bool>;

    fn overlapped_result(
        &self,
        handle: &Self::Handle,
        overlapped: &Self::Overlapped,
        wait: bool,
    ) -> io::Result<u32>;
    fn cancel_io(&self, handle: &Self::Handle, overlapped: &Self::Overlapped) -> io::Result<()>;

    fn create_process(
        &self,
        request: &ProcessRequest<'_, Self::Handle>,
    ) -> io::Result<ChildProcess<Self::Handle>>;
    fn resume_thread(&self, thread: &Self::Handle) -> io::Result<()>;
    fn terminate_process(&self, process: &Self::Handle, code: u32) -> io::Result<()>;
    fn exit_code(&self, process: &Self::Handle) -> io::Result<u32>;

    fn create_job(&self) -> io::Result<Self::Handle>;
    fn allow_breakaway(&self, job: &Self::Handle) -> io::Result<()>;
    fn associate_job(&self, job: &Self::Handle, port: Self::Port, key: usize) -> io::Result<()>;
    fn assign_to_job(&self, job: &Self::Handle, process: &Self::Handle) -> io::Result<()>;
    fn terminate_job(&self, job: &Self::Handle, code: u32) -> io::Result<()>;
}

pub(crate) fn os_error_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}
