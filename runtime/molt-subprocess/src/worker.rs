//! The control surface: request and response messages, and the thread that
//! owns the registry.
//!
//! Every request is pushed onto a channel and followed by a wake packet on
//! the completion port, so a worker blocked in the port wakes up and drains
//! the channel. Results come back on the response channel tagged with the
//! request's `msg_id`; process exits are reported unprompted.

use crate::completion::{Resolver, Settled};
use crate::config::WorkerConfig;
use crate::error::SubprocessError;
use crate::key::{PipeId, ProcessId};
use crate::process::SpawnOptions;
use crate::registry::{IoRegistry, ProcessInfo, SpawnedProcess};
use crate::sys::Sys;
use crate::trace_subprocess;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::io;
use std::thread::{self, JoinHandle};

const REQUEST_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Spawn(SpawnOptions),
    Read {
        pipe_id: PipeId,
        count: usize,
    },
    Write {
        pipe_id: PipeId,
        data: ByteBuf,
    },
    Close {
        pipe_id: PipeId,
        #[serde(default)]
        force: bool,
    },
    Kill {
        process_id: ProcessId,
    },
    Wait {
        process_id: ProcessId,
    },
    GetProcesses,
    WaitForNoProcesses,
    Shutdown,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Spawn(_) => "spawn",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Close { .. } => "close",
            Request::Kill { .. } => "kill",
            Request::Wait { .. } => "wait",
            Request::GetProcesses => "getProcesses",
            Request::WaitForNoProcesses => "waitForNoProcesses",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub msg_id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Spawned(SpawnedProcess),
    Bytes(ByteBuf),
    Count(usize),
    ExitCode(i64),
    Processes(Vec<ProcessInfo>),
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Success { msg_id: u64, data: ResponseData },
    Failure { msg_id: u64, error: ErrorInfo },
    ProcessExited { process_id: ProcessId, exit_code: i64 },
    /// Last message from a worker that has stopped.
    Close,
}

impl Response {
    pub fn failure(msg_id: u64, err: &SubprocessError) -> Self {
        Response::Failure {
            msg_id,
            error: ErrorInfo {
                message: err.to_string(),
                error_code: err.error_code(),
            },
        }
    }
}

/// Settles into a response for `msg_id`.
fn responder<T: 'static>(
    responses: &Sender<Response>,
    msg_id: u64,
    wrap: fn(T) -> ResponseData,
) -> Resolver<T> {
    let responses = responses.clone();
    Resolver::new(move |result: Settled<T>| {
        let response = match result {
            Ok(value) => Response::Success {
                msg_id,
                data: wrap(value),
            },
            Err(err) => Response::failure(msg_id, &err),
        };
        let _ = responses.send(response);
    })
}

fn reply(responses: &Sender<Response>, msg_id: u64, data: ResponseData) {
    let _ = responses.send(Response::Success { msg_id, data });
}

fn handle_request<S: Sys>(
    registry: &mut IoRegistry<S>,
    envelope: Envelope,
    responses: &Sender<Response>,
) {
    registry.note_message_handled();
    let Envelope { msg_id, request } = envelope;
    if trace_subprocess() {
        eprintln!("molt subprocess: request {msg_id} {}", request.name());
    }
    let outcome = match request {
        Request::Spawn(options) => registry.spawn(&options).map(|spawned| {
            let process_id = spawned.process_id;
            reply(responses, msg_id, ResponseData::Spawned(spawned));
            let exits = responses.clone();
            let on_exit = Resolver::new(move |result: Settled<i64>| {
                if let Ok(exit_code) = result {
                    let _ = exits.send(Response::ProcessExited {
                        process_id,
                        exit_code,
                    });
                }
            });
            if let Err(err) = registry.wait(process_id, on_exit) {
                eprintln!("molt subprocess: cannot watch process {process_id}: {err}");
            }
        }),
        Request::Read { pipe_id, count } => registry.read(
            pipe_id,
            count,
            responder(responses, msg_id, |buf| ResponseData::Bytes(ByteBuf::from(buf))),
        ),
        Request::Write { pipe_id, data } => registry.write(
            pipe_id,
            data.into_vec(),
            responder(responses, msg_id, ResponseData::Count),
        ),
        Request::Close { pipe_id, force } => registry.close(
            pipe_id,
            force,
            responder(responses, msg_id, |()| ResponseData::None),
        ),
        Request::Kill { process_id } => registry
            .kill(process_id)
            .map(|()| reply(responses, msg_id, ResponseData::None)),
        Request::Wait { process_id } => registry.wait(
            process_id,
            responder(responses, msg_id, ResponseData::ExitCode),
        ),
        Request::GetProcesses => {
            reply(
                responses,
                msg_id,
                ResponseData::Processes(registry.get_processes()),
            );
            Ok(())
        }
        Request::WaitForNoProcesses => {
            registry.wait_for_no_processes(responder(responses, msg_id, |()| ResponseData::None));
            Ok(())
        }
        Request::Shutdown => {
            registry.shutdown();
            Ok(())
        }
    };
    if let Err(err) = outcome {
        let _ = responses.send(Response::failure(msg_id, &err));
    }
}

fn run_worker<S: Sys>(
    sys: S,
    port: S::Port,
    config: WorkerConfig,
    requests: Receiver<Envelope>,
    responses: Sender<Response>,
) {
    let mut registry = IoRegistry::new(sys, port, config);
    while registry.is_running() {
        if registry.is_polling() {
            registry.poll();
            while registry.is_running() {
                match requests.try_recv() {
                    Ok(envelope) => handle_request(&mut registry, envelope, &responses),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => registry.shutdown(),
                }
            }
        } else {
            match requests.recv() {
                Ok(envelope) => handle_request(&mut registry, envelope, &responses),
                Err(_) => registry.shutdown(),
            }
        }
    }
    // Pending pipe requests are rejected before the close message goes out.
    drop(registry);
    if trace_subprocess() {
        eprintln!("molt subprocess: worker stopped");
    }
    let _ = responses.send(Response::Close);
}

/// Owns the completion port and the worker thread that drains it.
pub struct WorkerHandle<S: Sys> {
    sys: S,
    port_ref: S::Port,
    requests: Option<Sender<Envelope>>,
    responses: Receiver<Response>,
    thread: Option<JoinHandle<()>>,
    // Declared last: closed only after the worker has been joined.
    _port: S::Handle,
}

impl<S> WorkerHandle<S>
where
    S: Sys + Clone + Send + 'static,
{
    pub fn start(sys: S, config: WorkerConfig) -> io::Result<Self> {
        let port = sys.create_completion_port()?;
        let port_ref = sys.port_ref(&port);
        let (request_tx, request_rx) = bounded(REQUEST_QUEUE_DEPTH);
        let (response_tx, response_rx) = unbounded();
        let worker_sys = sys.clone();
        let thread = thread::Builder::new()
            .name("molt-subprocess".to_string())
            .spawn(move || run_worker(worker_sys, port_ref, config, request_rx, response_tx))?;
        Ok(Self {
            sys,
            port_ref,
            requests: Some(request_tx),
            responses: response_rx,
            thread: Some(thread),
            _port: port,
        })
    }
}

impl<S: Sys> WorkerHandle<S> {
    pub fn send(&self, msg_id: u64, request: Request) -> Result<(), SubprocessError> {
        let requests = self.requests.as_ref().ok_or(SubprocessError::Shutdown)?;
        requests
            .send(Envelope { msg_id, request })
            .map_err(|_| SubprocessError::Shutdown)?;
        self.sys
            .post_wake(self.port_ref)
            .map_err(|_| SubprocessError::Shutdown)
    }

    pub fn responses(&self) -> &Receiver<Response> {
        &self.responses
    }

    /// Stops the worker and waits for it. Responses sent before it stopped,
    /// ending with [`Response::Close`], stay readable.
    pub fn shutdown(&mut self) {
        if let Some(requests) = self.requests.take() {
            let _ = requests.send(Envelope {
                msg_id: 0,
                request: Request::Shutdown,
            });
            let _ = self.sys.post_wake(self.port_ref);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                eprintln!("molt subprocess: worker thread panicked");
            }
        }
    }
}

impl<S: Sys> Drop for WorkerHandle<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
