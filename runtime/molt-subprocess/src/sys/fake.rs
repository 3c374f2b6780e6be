//! Scripted in-memory OS used by the unit tests.
//!
//! The port is a plain queue. Pipe operations stay pending until a test
//! completes them, processes run until a test (or a job termination) ends
//! them, and every handle is tracked so leaks show up in assertions.

use super::*;
use crate::key::{PipeId, WAKE_KEY};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

const ERROR_INVALID_PARAMETER: i32 = 87;
const ERROR_NOT_FOUND: i32 = 1168;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Associate,
    CreatePipe,
    CreateProcess,
    CreateJob,
    AllowBreakaway,
    AssociateJob,
    AssignToJob,
    ExitCode,
    StartRead,
    StartWrite,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Port,
    PipeOurs(Direction),
    PipeTheirs(Direction),
    Stderr,
    Process(u32),
    Thread(u32),
    Job,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRecord {
    pub application: String,
    pub command_line: String,
    pub environment: Vec<u16>,
    pub workdir: Option<String>,
    pub stderr: Option<HandleKind>,
}

struct IoOp {
    buf: usize,
    len: u32,
    data: Vec<u8>,
    overlapped: usize,
    result: Option<Result<u32, i32>>,
}

struct Child {
    exit: Option<u32>,
    resumed: bool,
    job: Option<u64>,
}

#[derive(Default)]
struct Job {
    key: Option<usize>,
    breakaway: bool,
    members: Vec<u32>,
    terminated: bool,
}

struct State {
    next_handle: u64,
    next_pid: u32,
    live: HashMap<u64, HandleKind>,
    keys: HashMap<u64, usize>,
    ops: HashMap<u64, IoOp>,
    queue: VecDeque<Completion>,
    port_closed: bool,
    failures: HashMap<FakeOp, i32>,
    children: HashMap<u32, Child>,
    jobs: HashMap<u64, Job>,
    spawns: Vec<SpawnRecord>,
    written: HashMap<usize, Vec<u8>>,
    has_stderr: bool,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

#[derive(Clone)]
pub struct FakeSys {
    shared: Arc<Shared>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FakePort(u64);

pub struct FakeOverlapped {
    _slot: u64,
}

pub struct FakeHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if state.live.remove(&self.id) == Some(HandleKind::Port) {
            state.port_closed = true;
            self.shared.ready.notify_all();
        }
        state.ops.remove(&self.id);
        state.keys.remove(&self.id);
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn os_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl Default for FakeSys {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSys {
    pub fn new() -> Self {
        let state = State {
            next_handle: 1,
            next_pid: 4000,
            live: HashMap::new(),
            keys: HashMap::new(),
            ops: HashMap::new(),
            queue: VecDeque::new(),
            port_closed: false,
            failures: HashMap::new(),
            children: HashMap::new(),
            jobs: HashMap::new(),
            spawns: Vec::new(),
            written: HashMap::new(),
            has_stderr: true,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                ready: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared)
    }

    fn new_handle(&self, state: &mut State, kind: HandleKind) -> FakeHandle {
        let id = state.next_handle;
        state.next_handle += 1;
        state.live.insert(id, kind);
        FakeHandle {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    fn check(state: &mut State, op: FakeOp) -> io::Result<()> {
        match state.failures.remove(&op) {
            Some(code) => Err(os_err(code)),
            None => Ok(()),
        }
    }

    fn push(&self, state: &mut State, completion: Completion) {
        state.queue.push_back(completion);
        self.shared.ready.notify_all();
    }

    fn handle_for_key(state: &State, key: usize) -> u64 {
        state
            .keys
            .iter()
            .find_map(|(handle, k)| (*k == key).then_some(*handle))
            .unwrap_or_else(|| panic!("no handle associated with key {key:#x}"))
    }

    fn exit_locked(&self, state: &mut State, pid: u32, code: u32) {
        let Some(child) = state.children.get_mut(&pid) else {
            return;
        };
        if child.exit.is_some() {
            return;
        }
        child.exit = Some(code);
        let Some(job_id) = child.job else {
            return;
        };
        let Some(job) = state.jobs.get(&job_id) else {
            return;
        };
        let Some(key) = job.key else {
            return;
        };
        let all_done = job.members.iter().all(|member| {
            state
                .children
                .get(member)
                .is_none_or(|child| child.exit.is_some())
        });
        self.push(
            state,
            Completion {
                key,
                bytes: JOB_OBJECT_MSG_EXIT_PROCESS,
                overlapped: pid as usize,
                error: None,
            },
        );
        if all_done {
            self.push(
                state,
                Completion {
                    key,
                    bytes: JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO,
                    overlapped: 0,
                    error: None,
                },
            );
        }
    }

    fn job_of(state: &State, pid: u32) -> u64 {
        state
            .children
            .get(&pid)
            .and_then(|child| child.job)
            .unwrap_or_else(|| panic!("pid {pid} is not in a job"))
    }

    // Test controls.

    /// Makes the next call of `op` fail with the given OS error code.
    pub fn fail_next(&self, op: FakeOp, code: i32) {
        self.state().failures.insert(op, code);
    }

    pub fn set_has_stderr(&self, has_stderr: bool) {
        self.state().has_stderr = has_stderr;
    }

    /// Finishes the read in flight on `pipe` with `data` (truncated to the
    /// requested length) and queues its completion packet.
    pub fn complete_read(&self, pipe: PipeId, data: &[u8]) {
        let mut state = self.state();
        let key = pipe.completion_key();
        let handle = Self::handle_for_key(&state, key);
        let op = state
            .ops
            .get_mut(&handle)
            .filter(|op| op.result.is_none())
            .unwrap_or_else(|| panic!("no read pending on pipe {pipe}"));
        let count = data.len().min(op.len as usize);
        // SAFETY: the pipe keeps the buffer alive until the result is
        // collected, and the buffer is `op.len` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), op.buf as *mut u8, count);
        }
        op.result = Some(Ok(count as u32));
        let overlapped = op.overlapped;
        self.push(
            &mut state,
            Completion {
                key,
                bytes: count as u32,
                overlapped,
                error: None,
            },
        );
    }

    /// Reports `count` bytes written for the write in flight on `pipe`.
    pub fn complete_write(&self, pipe: PipeId, count: u32) {
        let mut state = self.state();
        let key = pipe.completion_key();
        let handle = Self::handle_for_key(&state, key);
        let op = state
            .ops
            .get_mut(&handle)
            .filter(|op| op.result.is_none())
            .unwrap_or_else(|| panic!("no write pending on pipe {pipe}"));
        op.result = Some(Ok(count));
        let accepted = op.data[..(count as usize).min(op.data.len())].to_vec();
        let overlapped = op.overlapped;
        state.written.entry(key).or_default().extend(accepted);
        self.push(
            &mut state,
            Completion {
                key,
                bytes: count,
                overlapped,
                error: None,
            },
        );
    }

    /// Fails the operation in flight on `pipe`; the packet carries `code`.
    pub fn fail_io(&self, pipe: PipeId, code: i32) {
        let mut state = self.state();
        let key = pipe.completion_key();
        let handle = Self::handle_for_key(&state, key);
        let op = state
            .ops
            .get_mut(&handle)
            .filter(|op| op.result.is_none())
            .unwrap_or_else(|| panic!("no operation pending on pipe {pipe}"));
        op.result = Some(Err(code));
        let overlapped = op.overlapped;
        self.push(
            &mut state,
            Completion {
                key,
                bytes: 0,
                overlapped,
                error: Some(code),
            },
        );
    }

    pub fn exit_process(&self, pid: u32, code: u32) {
        let mut state = self.state();
        self.exit_locked(&mut state, pid, code);
    }

    /// Starts a grandchild inside `parent`'s job and returns its pid.
    pub fn spawn_descendant(&self, parent: u32) -> u32 {
        let mut state = self.state();
        let job_id = Self::job_of(&state, parent);
        let pid = state.next_pid;
        state.next_pid += 1;
        state.children.insert(
            pid,
            Child {
                exit: None,
                resumed: true,
                job: Some(job_id),
            },
        );
        let key = state.jobs.get_mut(&job_id).and_then(|job| {
            job.members.push(pid);
            job.key
        });
        if let Some(key) = key {
            self.push(
                &mut state,
                Completion {
                    key,
                    bytes: JOB_OBJECT_MSG_NEW_PROCESS,
                    overlapped: pid as usize,
                    error: None,
                },
            );
        }
        pid
    }

    pub fn post(&self, completion: Completion) {
        let mut state = self.state();
        self.push(&mut state, completion);
    }

    pub fn clear_queue(&self) {
        self.state().queue.clear();
    }

    pub fn queued(&self) -> Vec<Completion> {
        self.state().queue.iter().copied().collect()
    }

    pub fn close_port(&self) {
        let mut state = self.state();
        state.port_closed = true;
        self.shared.ready.notify_all();
    }

    /// Kinds of every handle still open, the completion port excluded.
    pub fn live_handles(&self) -> Vec<HandleKind> {
        let state = self.state();
        let mut kinds: Vec<(u64, HandleKind)> = state
            .live
            .iter()
            .filter(|(_, kind)| **kind != HandleKind::Port)
            .map(|(id, kind)| (*id, kind.clone()))
            .collect();
        kinds.sort_by_key(|(id, _)| *id);
        kinds.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.state().spawns.clone()
    }

    pub fn written(&self, pipe: PipeId) -> Vec<u8> {
        self.state()
            .written
            .get(&pipe.completion_key())
            .cloned()
            .unwrap_or_default()
    }

    /// True while an operation on `pipe` has no result yet.
    pub fn io_pending(&self, pipe: PipeId) -> bool {
        let state = self.state();
        let key = pipe.completion_key();
        state
            .keys
            .iter()
            .find_map(|(handle, k)| (*k == key).then_some(*handle))
            .and_then(|handle| state.ops.get(&handle))
            .is_some_and(|op| op.result.is_none())
    }

    pub fn is_resumed(&self, pid: u32) -> bool {
        self.state()
            .children
            .get(&pid)
            .is_some_and(|child| child.resumed)
    }

    pub fn exit_status(&self, pid: u32) -> Option<u32> {
        self.state().children.get(&pid).and_then(|child| child.exit)
    }

    pub fn job_terminated(&self, pid: u32) -> bool {
        let state = self.state();
        let job_id = Self::job_of(&state, pid);
        state.jobs.get(&job_id).is_some_and(|job| job.terminated)
    }

    pub fn job_allows_breakaway(&self, pid: u32) -> bool {
        let state = self.state();
        let job_id = Self::job_of(&state, pid);
        state.jobs.get(&job_id).is_some_and(|job| job.breakaway)
    }

    fn start_op(
        &self,
        handle: &FakeHandle,
        overlapped: &FakeOverlapped,
        buf: usize,
        len: u32,
        data: Vec<u8>,
        op: FakeOp,
    ) -> io::Result<bool> {
        let mut state = self.state();
        Self::check(&mut state, op)?;
        if let Some(current) = state.ops.get(&handle.id) {
            assert!(
                current.result.is_some(),
                "second overlapped operation started on one handle"
            );
        }
        state.ops.insert(
            handle.id,
            IoOp {
                buf,
                len,
                data,
                overlapped: overlapped as *const FakeOverlapped as usize,
                result: None,
            },
        );
        Ok(false)
    }
}

impl Sys for FakeSys {
    type Handle = FakeHandle;
    type Overlapped = FakeOverlapped;
    type Port = FakePort;

    fn create_completion_port(&self) -> io::Result<FakeHandle> {
        let mut state = self.state();
        state.port_closed = false;
        Ok(self.new_handle(&mut state, HandleKind::Port))
    }

    fn port_ref(&self, port: &FakeHandle) -> FakePort {
        FakePort(port.id)
    }

    fn post_wake(&self, _port: FakePort) -> io::Result<()> {
        let mut state = self.state();
        if state.port_closed {
            return Err(os_err(ERROR_INVALID_PARAMETER));
        }
        self.push(
            &mut state,
            Completion {
                key: WAKE_KEY,
                bytes: 0,
                overlapped: 0,
                error: None,
            },
        );
        Ok(())
    }

    fn dequeue(&self, _port: FakePort, timeout: Duration) -> Dequeued {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if state.port_closed {
                return Dequeued::PortClosed;
            }
            if let Some(completion) = state.queue.pop_front() {
                return Dequeued::Packet(completion);
            }
            let now = Instant::now();
            if now >= deadline {
                return Dequeued::Timeout;
            }
            state = self
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner())
                .0;
        }
    }

    fn associate(&self, _port: FakePort, handle: &FakeHandle, key: usize) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::Associate)?;
        state.keys.insert(handle.id, key);
        Ok(())
    }

    fn duplicate(&self, handle: &FakeHandle, _inheritable: bool) -> io::Result<FakeHandle> {
        let mut state = self.state();
        let kind = state
            .live
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| os_err(ERROR_INVALID_PARAMETER))?;
        Ok(self.new_handle(&mut state, kind))
    }

    fn create_pipe(&self, direction: Direction) -> io::Result<PipePair<FakeHandle>> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::CreatePipe)?;
        let ours = self.new_handle(&mut state, HandleKind::PipeOurs(direction));
        let theirs = self.new_handle(&mut state, HandleKind::PipeTheirs(direction));
        Ok(PipePair { ours, theirs })
    }

    fn inherited_stderr(&self) -> io::Result<Option<FakeHandle>> {
        let mut state = self.state();
        if !state.has_stderr {
            return Ok(None);
        }
        Ok(Some(self.new_handle(&mut state, HandleKind::Stderr)))
    }

    fn new_overlapped(&self) -> Box<FakeOverlapped> {
        Box::new(FakeOverlapped { _slot: 0 })
    }

    unsafe fn start_read(
        &self,
        handle: &FakeHandle,
        overlapped: &FakeOverlapped,
        buf: *mut u8,
        len: u32,
    ) -> io::Result<bool> {
        self.start_op(handle, overlapped, buf as usize, len, Vec::new(), FakeOp::StartRead)
    }

    unsafe fn start_write(
        &self,
        handle: &FakeHandle,
        overlapped: &FakeOverlapped,
        buf: *const u8,
        len: u32,
    ) -> io::Result<bool> {
        // SAFETY: the caller guarantees `len` readable bytes at `buf`.
        let data = unsafe { std::slice::from_raw_parts(buf, len as usize) }.to_vec();
        self.start_op(handle, overlapped, buf as usize, len, data, FakeOp::StartWrite)
    }

    fn overlapped_result(
        &self,
        handle: &FakeHandle,
        _overlapped: &FakeOverlapped,
        _wait: bool,
    ) -> io::Result<u32> {
        let state = self.state();
        match state.ops.get(&handle.id).map(|op| op.result) {
            Some(Some(Ok(count))) => Ok(count),
            Some(Some(Err(code))) => Err(os_err(code)),
            Some(None) => Err(os_err(ERROR_IO_INCOMPLETE)),
            None => Err(os_err(ERROR_INVALID_PARAMETER)),
        }
    }

    fn cancel_io(&self, handle: &FakeHandle, _overlapped: &FakeOverlapped) -> io::Result<()> {
        let mut state = self.state();
        let key = state.keys.get(&handle.id).copied();
        let Some(op) = state
            .ops
            .get_mut(&handle.id)
            .filter(|op| op.result.is_none())
        else {
            return Err(os_err(ERROR_NOT_FOUND));
        };
        op.result = Some(Err(ERROR_OPERATION_ABORTED));
        let overlapped = op.overlapped;
        if let Some(key) = key {
            self.push(
                &mut state,
                Completion {
                    key,
                    bytes: 0,
                    overlapped,
                    error: Some(ERROR_OPERATION_ABORTED),
                },
            );
        }
        Ok(())
    }

    fn create_process(
        &self,
        request: &ProcessRequest<'_, FakeHandle>,
    ) -> io::Result<ChildProcess<FakeHandle>> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::CreateProcess)?;
        let stderr = request
            .stderr
            .and_then(|handle| state.live.get(&handle.id).cloned());
        state.spawns.push(SpawnRecord {
            application: request.application.to_string(),
            command_line: request.command_line.to_string(),
            environment: request.environment.to_vec(),
            workdir: request.workdir.map(str::to_string),
            stderr,
        });
        let pid = state.next_pid;
        state.next_pid += 1;
        state.children.insert(
            pid,
            Child {
                exit: None,
                resumed: false,
                job: None,
            },
        );
        let process = self.new_handle(&mut state, HandleKind::Process(pid));
        let thread = self.new_handle(&mut state, HandleKind::Thread(pid));
        Ok(ChildProcess {
            process,
            thread,
            pid,
        })
    }

    fn resume_thread(&self, thread: &FakeHandle) -> io::Result<()> {
        let mut state = self.state();
        let Some(HandleKind::Thread(pid)) = state.live.get(&thread.id).cloned() else {
            return Err(os_err(ERROR_INVALID_PARAMETER));
        };
        if let Some(child) = state.children.get_mut(&pid) {
            child.resumed = true;
        }
        Ok(())
    }

    fn terminate_process(&self, process: &FakeHandle, code: u32) -> io::Result<()> {
        let mut state = self.state();
        let Some(HandleKind::Process(pid)) = state.live.get(&process.id).cloned() else {
            return Err(os_err(ERROR_INVALID_PARAMETER));
        };
        self.exit_locked(&mut state, pid, code);
        Ok(())
    }

    fn exit_code(&self, process: &FakeHandle) -> io::Result<u32> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::ExitCode)?;
        let Some(HandleKind::Process(pid)) = state.live.get(&process.id).cloned() else {
            return Err(os_err(ERROR_INVALID_PARAMETER));
        };
        Ok(state
            .children
            .get(&pid)
            .and_then(|child| child.exit)
            .unwrap_or(STILL_ACTIVE))
    }

    fn create_job(&self) -> io::Result<FakeHandle> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::CreateJob)?;
        let job = self.new_handle(&mut state, HandleKind::Job);
        state.jobs.insert(job.id, Job::default());
        Ok(job)
    }

    fn allow_breakaway(&self, job: &FakeHandle) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::AllowBreakaway)?;
        if let Some(job) = state.jobs.get_mut(&job.id) {
            job.breakaway = true;
        }
        Ok(())
    }

    fn associate_job(&self, job: &FakeHandle, _port: FakePort, key: usize) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::AssociateJob)?;
        if let Some(job) = state.jobs.get_mut(&job.id) {
            job.key = Some(key);
        }
        Ok(())
    }

    fn assign_to_job(&self, job: &FakeHandle, process: &FakeHandle) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&mut state, FakeOp::AssignToJob)?;
        let Some(HandleKind::Process(pid)) = state.live.get(&process.id).cloned() else {
            return Err(os_err(ERROR_INVALID_PARAMETER));
        };
        if let Some(child) = state.children.get_mut(&pid) {
            child.job = Some(job.id);
        }
        let key = state.jobs.get_mut(&job.id).and_then(|job| {
            job.members.push(pid);
            job.key
        });
        if let Some(key) = key {
            self.push(
                &mut state,
                Completion {
                    key,
                    bytes: JOB_OBJECT_MSG_NEW_PROCESS,
                    overlapped: pid as usize,
                    error: None,
                },
            );
        }
        Ok(())
    }

    fn terminate_job(&self, job: &FakeHandle, code: u32) -> io::Result<()> {
        let mut state = self.state();
        let members = match state.jobs.get_mut(&job.id) {
            Some(job) => {
                job.terminated = true;
                job.members.clone()
            }
            None => return Err(os_err(ERROR_INVALID_PARAMETER)),
        };
        for pid in members {
            self.exit_locked(&mut state, pid, code);
        }
        Ok(())
    }
}
