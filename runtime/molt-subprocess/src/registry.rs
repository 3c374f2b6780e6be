//! The worker's view of every live pipe and process, and the loop that
//! drains the completion port on their behalf.

use crate::completion::Resolver;
use crate::config::WorkerConfig;
use crate::error::SubprocessError;
use crate::key::{CompletionTarget, IdAllocator, PipeId, ProcessId};
use crate::pipe::Pipe;
use crate::process::{Process, SpawnOptions};
use crate::sys::{
    Completion, Dequeued, ERROR_BROKEN_PIPE, JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS,
    JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO, JOB_OBJECT_MSG_EXIT_PROCESS, Sys,
};
use crate::trace_subprocess;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedProcess {
    pub process_id: ProcessId,
    pub pid: u32,
    /// stdin, stdout, and stderr when it has its own pipe.
    pub pipes: Vec<PipeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub process_id: ProcessId,
    pub pid: u32,
}

pub struct IoRegistry<S: Sys> {
    sys: S,
    port: S::Port,
    config: WorkerConfig,
    pipes: HashMap<PipeId, Pipe<S>>,
    processes: BTreeMap<ProcessId, Process<S>>,
    ids: IdAllocator,
    // Wake packets seen minus control messages handled.
    message_count: isize,
    running: bool,
    polling: bool,
    idle_waiters: Vec<Resolver<()>>,
}

impl<S: Sys> IoRegistry<S> {
    /// `port` is borrowed; its owner keeps it open for the registry's life.
    pub fn new(sys: S, port: S::Port, config: WorkerConfig) -> Self {
        Self {
            sys,
            port,
            config,
            pipes: HashMap::new(),
            processes: BTreeMap::new(),
            ids: IdAllocator::new(),
            message_count: 0,
            running: true,
            polling: false,
            idle_waiters: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn message_count(&self) -> isize {
        self.message_count
    }

    pub fn note_message_handled(&mut self) {
        self.message_count -= 1;
    }

    pub fn pipe(&self, id: PipeId) -> Option<&Pipe<S>> {
        self.pipes.get(&id)
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process<S>> {
        self.processes.get(&id)
    }

    pub fn spawn(&mut self, options: &SpawnOptions) -> Result<SpawnedProcess, SubprocessError> {
        let id = self
            .ids
            .next_process()
            .ok_or_else(|| SubprocessError::Spawn("Process ids exhausted".to_string()))?;
        let (process, pipes) = Process::spawn(
            &self.sys,
            self.port,
            id,
            &mut self.ids,
            &self.config.comspec,
            options,
        )?;
        let spawned = SpawnedProcess {
            process_id: id,
            pid: process.pid(),
            pipes: process.pipes().to_vec(),
        };
        for pipe in pipes {
            self.pipes.insert(pipe.id(), pipe);
        }
        self.processes.insert(id, process);
        self.update_poll_events();
        Ok(spawned)
    }

    fn process_mut(&mut self, id: ProcessId) -> Result<&mut Process<S>, SubprocessError> {
        self.processes
            .get_mut(&id)
            .ok_or(SubprocessError::InvalidProcess(id))
    }

    pub fn read(
        &mut self,
        id: PipeId,
        length: usize,
        resolver: Resolver<Vec<u8>>,
    ) -> Result<(), SubprocessError> {
        let pipe = self.pipes.get_mut(&id).ok_or(SubprocessError::EndOfFile)?;
        pipe.read(&self.sys, length, resolver)?;
        self.after_pipe_change(id);
        Ok(())
    }

    pub fn write(
        &mut self,
        id: PipeId,
        data: Vec<u8>,
        resolver: Resolver<usize>,
    ) -> Result<(), SubprocessError> {
        let pipe = self.pipes.get_mut(&id).ok_or(SubprocessError::EndOfFile)?;
        pipe.write(&self.sys, data, resolver)?;
        self.after_pipe_change(id);
        Ok(())
    }

    /// Closes a pipe. A pipe that was already closed and released settles
    /// right away.
    pub fn close(
        &mut self,
        id: PipeId,
        force: bool,
        resolver: Resolver<()>,
    ) -> Result<(), SubprocessError> {
        let Some(pipe) = self.pipes.get_mut(&id) else {
            if self.ids.pipe_allocated(id) {
                resolver.resolve(());
                return Ok(());
            }
            return Err(SubprocessError::EndOfFile);
        };
        pipe.close(&self.sys, force, Some(resolver));
        self.after_pipe_change(id);
        Ok(())
    }

    pub fn kill(&mut self, id: ProcessId) -> Result<(), SubprocessError> {
        let process = self.processes.get_mut(&id).ok_or(SubprocessError::InvalidProcess(id))?;
        process.kill(&self.sys);
        Ok(())
    }

    /// Settles `resolver` with the exit code once the process exits.
    pub fn wait(&mut self, id: ProcessId, resolver: Resolver<i64>) -> Result<(), SubprocessError> {
        let process = self.process_mut(id)?;
        process.add_exit_waiter(resolver);
        self.check_process(id);
        Ok(())
    }

    pub fn get_processes(&self) -> Vec<ProcessInfo> {
        self.processes
            .values()
            .map(|process| ProcessInfo {
                process_id: process.id(),
                pid: process.pid(),
            })
            .collect()
    }

    pub fn wait_for_no_processes(&mut self, resolver: Resolver<()>) {
        if self.processes.is_empty() {
            resolver.resolve(());
        } else {
            self.idle_waiters.push(resolver);
        }
    }

    /// Drops closed pipes and re-evaluates polling.
    fn after_pipe_change(&mut self, id: PipeId) {
        if self.pipes.get(&id).is_some_and(Pipe::is_closed) {
            self.pipes.remove(&id);
        }
        self.update_poll_events();
    }

    fn check_process(&mut self, id: ProcessId) {
        let Some(process) = self.processes.get_mut(&id) else {
            return;
        };
        if process.on_ready(&self.sys).is_some() {
            self.finish_process(id);
        }
        self.update_poll_events();
    }

    /// Runs once a process's exit has been observed.
    fn finish_process(&mut self, id: ProcessId) {
        let Some(mut process) = self.processes.remove(&id) else {
            return;
        };
        for pipe_id in process.pipes() {
            if let Some(pipe) = self.pipes.get_mut(pipe_id) {
                pipe.maybe_close(&self.sys);
                if pipe.is_closed() {
                    self.pipes.remove(pipe_id);
                }
            }
        }
        process.settle_exit_waiters();
        if self.processes.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                waiter.resolve(());
            }
        }
    }

    pub fn update_poll_events(&mut self) {
        let should_poll = self.processes.values().any(Process::is_alive)
            || self.pipes.values().any(Pipe::has_pending_io);
        self.polling = should_poll && self.running;
    }

    /// Drains the completion port: the first wait may block for the poll
    /// timeout when no control message is outstanding, later waits only
    /// collect what is already queued.
    pub fn poll(&mut self) {
        let mut timeout = if self.message_count > 0 {
            Duration::ZERO
        } else {
            self.config.poll_timeout
        };
        loop {
            match self.sys.dequeue(self.port, timeout) {
                Dequeued::Timeout => break,
                Dequeued::PortClosed => {
                    if trace_subprocess() {
                        eprintln!("molt subprocess: completion port closed");
                    }
                    self.shutdown();
                    break;
                }
                Dequeued::Failed(code) => {
                    if trace_subprocess() {
                        eprintln!("molt subprocess: dequeue failed: {code}");
                    }
                    break;
                }
                Dequeued::Packet(completion) => self.dispatch(completion),
            }
            timeout = Duration::ZERO;
        }
        self.update_poll_events();
    }

    fn dispatch(&mut self, completion: Completion) {
        match CompletionTarget::decode(completion.key) {
            CompletionTarget::Wake => self.message_count += 1,
            CompletionTarget::Pipe(id) => self.dispatch_pipe(id, completion),
            CompletionTarget::Process(id) => self.dispatch_process(id, completion),
            CompletionTarget::Unknown(key) => {
                eprintln!("molt subprocess: unexpected completion key {key:#x}");
            }
        }
    }

    fn dispatch_pipe(&mut self, id: PipeId, completion: Completion) {
        let Some(pipe) = self.pipes.get_mut(&id) else {
            // Late packets for pipes already closed, e.g. cancelled reads.
            if trace_subprocess() {
                eprintln!("molt subprocess: completion for unknown pipe {id}");
            }
            return;
        };
        if completion.error == Some(ERROR_BROKEN_PIPE) {
            pipe.on_error(&self.sys);
        } else if let Err(err) = pipe.on_ready(&self.sys) {
            eprintln!("molt subprocess: pipe {id} handler failed: {err}");
            pipe.on_error(&self.sys);
        }
        self.after_pipe_change(id);
    }

    fn dispatch_process(&mut self, id: ProcessId, completion: Completion) {
        let is_exit = matches!(
            completion.bytes,
            JOB_OBJECT_MSG_EXIT_PROCESS | JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS
        );
        if !is_exit && completion.bytes != JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO {
            return;
        }
        // A job-empty packet routinely trails an exit already handled.
        let Some(process) = self.processes.get(&id) else {
            return;
        };
        if is_exit && completion.overlapped as u32 != process.pid() {
            // A descendant exited, not the process itself.
            return;
        }
        self.check_process(id);
    }

    /// Stops the loop; the worker answers with its close message.
    pub fn shutdown(&mut self) {
        self.running = false;
        self.polling = false;
    }
}

impl<S: Sys> Drop for IoRegistry<S> {
    fn drop(&mut self) {
        for pipe in self.pipes.values_mut() {
            pipe.close(&self.sys, true, None);
        }
        self.pipes.clear();
    }
}
