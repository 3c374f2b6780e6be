//! Child processes and the job objects that supervise them.

use crate::command::{build_command_line, check_no_nul, environment_block};
use crate::completion::Resolver;
use crate::error::SubprocessError;
use crate::key::{IdAllocator, PipeId, ProcessId};
use crate::pipe::{Direction, Pipe};
use crate::sys::{
    ChildProcess, ERROR_BAD_EXE_FORMAT, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND,
    KILLED_EXIT_CODE, ProcessRequest, STILL_ACTIVE, Sys, TERMINATE_EXIT_CODE, os_error_code,
};
use crate::trace_subprocess;
use serde::{Deserialize, Serialize};
use std::io;

/// Where the child's stderr goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// A third pipe the worker reads from.
    #[default]
    Pipe,
    /// Same pipe as stdout.
    Stdout,
    /// The worker's own stderr, if it has one.
    Inherit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    pub command: String,
    /// Full argument vector, program name first.
    pub arguments: Vec<String>,
    /// `NAME=value` entries.
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub stderr: StderrMode,
}

impl SpawnOptions {
    fn validate(&self) -> Result<(), SubprocessError> {
        check_no_nul("Command", &self.command)?;
        for arg in &self.arguments {
            check_no_nul("Argument", arg)?;
        }
        for entry in &self.environment {
            check_no_nul("Environment entry", entry)?;
        }
        if let Some(workdir) = &self.workdir {
            check_no_nul("Working directory", workdir)?;
        }
        Ok(())
    }
}

/// The child's ends of its standard streams.
struct ChildStdio<H> {
    stdin: H,
    stdout: H,
    stderr: Option<H>,
}

pub struct Process<S: Sys> {
    id: ProcessId,
    pid: u32,
    handle: Option<S::Handle>,
    job: Option<S::Handle>,
    exit_code: Option<i64>,
    killed: bool,
    pipes: Vec<PipeId>,
    exit_waiters: Vec<Resolver<i64>>,
}

impl<S: Sys> Process<S> {
    /// Starts `options.command` suspended, puts it in a fresh job associated
    /// with the completion port, then lets it run.
    ///
    /// Returns the process together with its pipes: stdin, stdout, then
    /// stderr when it has its own pipe. On failure nothing created along the
    /// way survives; a child that was already created is terminated.
    pub fn spawn(
        sys: &S,
        port: S::Port,
        id: ProcessId,
        ids: &mut IdAllocator,
        comspec: &str,
        options: &SpawnOptions,
    ) -> Result<(Self, Vec<Pipe<S>>), SubprocessError> {
        options.validate()?;
        let (application, command_line) =
            build_command_line(&options.command, &options.arguments, comspec);
        let environment = environment_block(&options.environment);

        let mut pipes = Vec::new();
        let stdio = match Self::open_pipes(sys, port, id, ids, options.stderr, &mut pipes) {
            Ok(stdio) => stdio,
            Err(err) => {
                close_all(sys, &mut pipes);
                return Err(err);
            }
        };

        let created = sys.create_process(&ProcessRequest {
            application: &application,
            command_line: &command_line,
            environment: &environment,
            workdir: options.workdir.as_deref(),
            stdin: &stdio.stdin,
            stdout: &stdio.stdout,
            stderr: stdio.stderr.as_ref(),
        });
        drop(stdio);
        let child = match created {
            Ok(child) => child,
            Err(err) => {
                close_all(sys, &mut pipes);
                return Err(create_process_error(&options.command, &err));
            }
        };

        let job = match Self::supervise(sys, port, id, &child.process) {
            Ok(job) => job,
            Err(message) => {
                // Still suspended; it must not run outside a job.
                let _ = sys.terminate_process(&child.process, TERMINATE_EXIT_CODE);
                close_all(sys, &mut pipes);
                return Err(SubprocessError::Spawn(message));
            }
        };

        let ChildProcess {
            process,
            thread,
            pid,
        } = child;
        if let Err(err) = sys.resume_thread(&thread) {
            let _ = sys.terminate_job(&job, TERMINATE_EXIT_CODE);
            close_all(sys, &mut pipes);
            return Err(SubprocessError::Spawn(os_failure(
                "Failed to resume process",
                &err,
            )));
        }
        drop(thread);

        if trace_subprocess() {
            eprintln!("molt subprocess: spawned process {id} pid={pid} cmd={command_line}");
        }
        let process = Self {
            id,
            pid,
            handle: Some(process),
            job: Some(job),
            exit_code: None,
            killed: false,
            pipes: pipes.iter().map(Pipe::id).collect(),
            exit_waiters: Vec::new(),
        };
        Ok((process, pipes))
    }

    fn open_pipes(
        sys: &S,
        port: S::Port,
        id: ProcessId,
        ids: &mut IdAllocator,
        stderr: StderrMode,
        pipes: &mut Vec<Pipe<S>>,
    ) -> Result<ChildStdio<S::Handle>, SubprocessError> {
        let stdin = Self::open_pipe(sys, port, id, ids, Direction::Output, pipes)?;
        let stdout = Self::open_pipe(sys, port, id, ids, Direction::Input, pipes)?;
        let stderr = match stderr {
            StderrMode::Pipe => Some(Self::open_pipe(sys, port, id, ids, Direction::Input, pipes)?),
            StderrMode::Stdout => Some(sys.duplicate(&stdout, true).map_err(pipe_error)?),
            StderrMode::Inherit => sys.inherited_stderr().map_err(pipe_error)?,
        };
        Ok(ChildStdio {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Creates one pipe, keeps our end, and returns the child's end.
    fn open_pipe(
        sys: &S,
        port: S::Port,
        id: ProcessId,
        ids: &mut IdAllocator,
        direction: Direction,
        pipes: &mut Vec<Pipe<S>>,
    ) -> Result<S::Handle, SubprocessError> {
        let pipe_id = ids
            .next_pipe()
            .ok_or_else(|| SubprocessError::Spawn("Pipe ids exhausted".to_string()))?;
        let pair = sys.create_pipe(direction).map_err(pipe_error)?;
        let pipe = Pipe::new(sys, port, pipe_id, id, direction, pair.ours).map_err(pipe_error)?;
        pipes.push(pipe);
        Ok(pair.theirs)
    }

    fn supervise(
        sys: &S,
        port: S::Port,
        id: ProcessId,
        process: &S::Handle,
    ) -> Result<S::Handle, String> {
        let job = sys
            .create_job()
            .map_err(|err| os_failure("Failed to create job object", &err))?;
        sys.allow_breakaway(&job)
            .map_err(|err| os_failure("Failed to set job limits", &err))?;
        sys.associate_job(&job, port, id.completion_key())
            .map_err(|err| os_failure("Failed to set IOCP", &err))?;
        sys.assign_to_job(&job, process)
            .map_err(|err| os_failure("Failed to attach process to job object", &err))?;
        Ok(job)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pipes(&self) -> &[PipeId] {
        &self.pipes
    }

    /// True until the exit has been observed.
    pub fn is_alive(&self) -> bool {
        self.handle.is_some()
    }

    /// Terminates the whole job, descendants included.
    pub fn kill(&mut self, sys: &S) {
        if self.exit_code.is_some() {
            return;
        }
        self.killed = true;
        if let Some(job) = self.job.as_ref() {
            if let Err(err) = sys.terminate_job(job, TERMINATE_EXIT_CODE) {
                eprintln!("molt subprocess: failed to terminate process {}: {err}", self.id);
            }
        }
    }

    /// Polls for the exit code without blocking. Once the process has exited
    /// its handles are released and the code is cached.
    pub fn wait(&mut self, sys: &S) -> Option<i64> {
        if let Some(code) = self.exit_code {
            return Some(code);
        }
        let handle = self.handle.as_ref()?;
        let status = match sys.exit_code(handle) {
            Ok(status) => status,
            Err(err) => {
                eprintln!(
                    "molt subprocess: exit code of process {} unavailable: {err}",
                    self.id
                );
                return None;
            }
        };
        if status == STILL_ACTIVE {
            return None;
        }
        let code = if self.killed && status == TERMINATE_EXIT_CODE {
            KILLED_EXIT_CODE
        } else {
            i64::from(status)
        };
        self.exit_code = Some(code);
        self.handle = None;
        // Take down whatever the child left running in its job.
        if let Some(job) = self.job.take() {
            let _ = sys.terminate_job(&job, TERMINATE_EXIT_CODE);
        }
        if trace_subprocess() {
            eprintln!("molt subprocess: process {} exited code={code}", self.id);
        }
        Some(code)
    }

    pub fn on_ready(&mut self, sys: &S) -> Option<i64> {
        self.wait(sys)
    }

    pub fn add_exit_waiter(&mut self, waiter: Resolver<i64>) {
        match self.exit_code {
            Some(code) => waiter.resolve(code),
            None => self.exit_waiters.push(waiter),
        }
    }

    pub(crate) fn settle_exit_waiters(&mut self) {
        let Some(code) = self.exit_code else {
            return;
        };
        for waiter in self.exit_waiters.drain(..) {
            waiter.resolve(code);
        }
    }
}

fn close_all<S: Sys>(sys: &S, pipes: &mut [Pipe<S>]) {
    for pipe in pipes.iter_mut() {
        pipe.close(sys, true, None);
    }
}

fn os_failure(what: &str, err: &io::Error) -> String {
    format!("{what}: 0x{:x}", os_error_code(err))
}

fn pipe_error(err: io::Error) -> SubprocessError {
    SubprocessError::Spawn(os_failure("Failed to create pipe", &err))
}

fn create_process_error(command: &str, err: &io::Error) -> SubprocessError {
    match os_error_code(err) {
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND | ERROR_BAD_EXE_FORMAT => {
            SubprocessError::BadExecutable(format!(
                "File at path \"{command}\" does not exist, or is not executable"
            ))
        }
        _ => SubprocessError::Spawn(os_failure("Failed to create process", err)),
    }
}
