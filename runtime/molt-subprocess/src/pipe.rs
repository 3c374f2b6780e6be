//! One end of a child's standard stream, driven by overlapped I/O.
//!
//! A pipe keeps a FIFO of logical requests and at most one OS operation in
//! flight: the head of the queue. Completions arrive through the registry,
//! which calls [`Pipe::on_ready`] or [`Pipe::on_error`].

use crate::completion::Resolver;
use crate::error::SubprocessError;
use crate::key::{PipeId, ProcessId};
use crate::sys::Sys;
use crate::trace_subprocess;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::mem::ManuallyDrop;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The worker reads; the child writes (stdout, stderr).
    Input,
    /// The worker writes; the child reads (stdin).
    Output,
}

enum Request {
    Read {
        length: usize,
        resolver: Resolver<Vec<u8>>,
    },
    Write {
        data: Vec<u8>,
        resolver: Resolver<usize>,
    },
}

impl Request {
    fn reject(self, err: SubprocessError) {
        match self {
            Request::Read { resolver, .. } => resolver.reject(err),
            Request::Write { resolver, .. } => resolver.reject(err),
        }
    }
}

pub struct Pipe<S: Sys> {
    id: PipeId,
    process: ProcessId,
    direction: Direction,
    handle: Option<S::Handle>,
    // Leaked instead of freed if the pipe is dropped mid-operation.
    overlapped: ManuallyDrop<Box<S::Overlapped>>,
    in_flight: Option<Vec<u8>>,
    pending: VecDeque<Request>,
    closing: bool,
    closed: bool,
    close_waiters: Vec<Resolver<()>>,
    owner_exited: bool,
}

impl<S: Sys> Pipe<S> {
    /// Takes ownership of `origin`, keeping only a private, non-inheritable
    /// duplicate registered with the completion port.
    pub fn new(
        sys: &S,
        port: S::Port,
        id: PipeId,
        process: ProcessId,
        direction: Direction,
        origin: S::Handle,
    ) -> io::Result<Self> {
        let handle = sys.duplicate(&origin, false)?;
        drop(origin);
        if let Err(err) = sys.associate(port, &handle, id.completion_key()) {
            eprintln!("molt subprocess: failed to associate pipe {id} with the port: {err}");
        }
        Ok(Self {
            id,
            process,
            direction,
            handle: Some(handle),
            overlapped: ManuallyDrop::new(sys.new_overlapped()),
            in_flight: None,
            pending: VecDeque::new(),
            closing: false,
            closed: false,
            close_waiters: Vec::new(),
            owner_exited: false,
        })
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn has_pending_io(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn read(
        &mut self,
        sys: &S,
        length: usize,
        resolver: Resolver<Vec<u8>>,
    ) -> Result<(), SubprocessError> {
        if self.direction != Direction::Input {
            return Err(SubprocessError::InvalidPipe {
                pipe: self.id,
                op: "read",
            });
        }
        if self.closing || self.closed {
            return Err(SubprocessError::ClosedPipe {
                pipe: self.id,
                op: "read from",
            });
        }
        self.pending.push_back(Request::Read { length, resolver });
        self.start_next(sys);
        Ok(())
    }

    pub fn write(
        &mut self,
        sys: &S,
        data: Vec<u8>,
        resolver: Resolver<usize>,
    ) -> Result<(), SubprocessError> {
        if self.direction != Direction::Output {
            return Err(SubprocessError::InvalidPipe {
                pipe: self.id,
                op: "write",
            });
        }
        if self.closing || self.closed {
            return Err(SubprocessError::ClosedPipe {
                pipe: self.id,
                op: "write to",
            });
        }
        self.pending.push_back(Request::Write { data, resolver });
        self.start_next(sys);
        Ok(())
    }

    /// Arms the head of the queue unless an operation is already in flight.
    /// A closing pipe whose queue ran dry closes here.
    fn start_next(&mut self, sys: &S) {
        while self.in_flight.is_none() && !self.closed {
            let Some(handle) = self.handle.as_ref() else {
                return;
            };
            let started = match self.pending.front_mut() {
                None => {
                    if self.closing {
                        self.close(sys, true, None);
                    }
                    return;
                }
                Some(Request::Read { length, .. }) => {
                    let length = *length;
                    if length == 0 {
                        if let Some(Request::Read { resolver, .. }) = self.pending.pop_front() {
                            resolver.resolve(Vec::new());
                        }
                        continue;
                    }
                    let len = clamp_len(length);
                    let buf = self.in_flight.insert(vec![0u8; len as usize]);
                    // SAFETY: the buffer and the overlapped record belong to
                    // this pipe and stay put until the result is collected;
                    // `close` cancels and reaps before releasing either.
                    unsafe { sys.start_read(handle, &self.overlapped, buf.as_mut_ptr(), len) }
                }
                Some(Request::Write { data, .. }) => {
                    if data.is_empty() {
                        if let Some(Request::Write { resolver, .. }) = self.pending.pop_front() {
                            resolver.resolve(0);
                        }
                        continue;
                    }
                    let data = std::mem::take(data);
                    let len = clamp_len(data.len());
                    let buf = self.in_flight.insert(data);
                    // SAFETY: as for reads.
                    unsafe { sys.start_write(handle, &self.overlapped, buf.as_ptr(), len) }
                }
            };
            match started {
                Ok(false) if self.owner_exited && self.direction == Direction::Input => {
                    // A descendant may hold the write end open forever.
                    if trace_subprocess() {
                        eprintln!(
                            "molt subprocess: pipe {} read pending after process exit",
                            self.id
                        );
                    }
                    self.on_error(sys);
                }
                Ok(_) => {}
                Err(err) => {
                    if trace_subprocess() {
                        eprintln!("molt subprocess: pipe {} start failed: {err}", self.id);
                    }
                    self.in_flight = None;
                    self.on_error(sys);
                }
            }
            return;
        }
    }

    /// Handles the completion packet of the operation in flight.
    pub fn on_ready(&mut self, sys: &S) -> io::Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(io::Error::other(format!(
                "completion for pipe {} after its handle was released",
                self.id
            )));
        };
        if self.in_flight.is_none() {
            return Err(io::Error::other(format!(
                "completion for pipe {} with no operation in flight",
                self.id
            )));
        }
        let transferred = match sys.overlapped_result(handle, &self.overlapped, false) {
            Ok(count) => count as usize,
            Err(err) => {
                if trace_subprocess() {
                    eprintln!("molt subprocess: pipe {} failed: {err}", self.id);
                }
                self.on_error(sys);
                return Ok(());
            }
        };
        let Some(mut buf) = self.in_flight.take() else {
            return Ok(());
        };
        match self.direction {
            Direction::Input => {
                if transferred == 0 {
                    // Nothing arrived; ask again for the same request.
                    self.start_next(sys);
                    return Ok(());
                }
                buf.truncate(transferred);
                match self.pending.pop_front() {
                    Some(Request::Read { resolver, .. }) => resolver.resolve(buf),
                    Some(other) => other.reject(SubprocessError::EndOfFile),
                    None => {}
                }
            }
            Direction::Output => {
                if transferred != buf.len() {
                    if trace_subprocess() {
                        eprintln!(
                            "molt subprocess: pipe {} short write {transferred}/{}",
                            self.id,
                            buf.len()
                        );
                    }
                    self.on_error(sys);
                    return Ok(());
                }
                match self.pending.pop_front() {
                    Some(Request::Write { resolver, .. }) => resolver.resolve(transferred),
                    Some(other) => other.reject(SubprocessError::EndOfFile),
                    None => {}
                }
            }
        }
        self.start_next(sys);
        Ok(())
    }

    pub fn on_error(&mut self, sys: &S) {
        self.close(sys, true, None);
    }

    /// Closes the pipe. Without `force`, a pipe with queued requests only
    /// stops accepting new ones and closes once the queue drains. `waiter`
    /// settles when the handle is released.
    pub fn close(&mut self, sys: &S, force: bool, waiter: Option<Resolver<()>>) {
        if self.closed {
            if let Some(waiter) = waiter {
                waiter.resolve(());
            }
            return;
        }
        if !force && !self.pending.is_empty() {
            self.closing = true;
            self.close_waiters.extend(waiter);
            return;
        }

        self.cancel_in_flight(sys);
        for request in self.pending.drain(..) {
            request.reject(SubprocessError::EndOfFile);
        }
        self.handle = None;
        self.closed = true;
        if trace_subprocess() {
            eprintln!("molt subprocess: pipe {} closed", self.id);
        }
        for waiter in self.close_waiters.drain(..).chain(waiter) {
            waiter.resolve(());
        }
    }

    /// Called once the owning process has exited. A read still waiting for
    /// data is checked without blocking and fails the pipe if nothing came.
    pub fn maybe_close(&mut self, sys: &S) {
        self.owner_exited = true;
        if self.direction != Direction::Input || self.in_flight.is_none() {
            return;
        }
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        if sys.overlapped_result(handle, &self.overlapped, false).is_err() {
            self.on_error(sys);
        }
    }

    fn cancel_in_flight(&mut self, sys: &S) {
        if self.in_flight.is_none() {
            return;
        }
        if let Some(handle) = self.handle.as_ref() {
            // The kernel owns the buffer until the cancelled operation is reaped.
            let _ = sys.cancel_io(handle, &self.overlapped);
            let _ = sys.overlapped_result(handle, &self.overlapped, true);
        }
        self.in_flight = None;
    }
}

impl<S: Sys> Drop for Pipe<S> {
    fn drop(&mut self) {
        match self.in_flight.take() {
            // No `Sys` to cancel with here: closing the handle cancels the
            // operation, but the kernel may still touch both allocations.
            Some(buf) => std::mem::forget(buf),
            // SAFETY: dropped exactly once, and no operation references it.
            None => unsafe { ManuallyDrop::drop(&mut self.overlapped) },
        }
    }
}

fn clamp_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
