use crate::key::{PipeId, ProcessId};
use std::fmt;

pub const ERROR_END_OF_FILE: u32 = 0xff7a;
pub const ERROR_INVALID_PIPE: u32 = 0xff7b;
pub const ERROR_BAD_EXECUTABLE: u32 = 0xff7c;
pub const ERROR_INVALID_OPTION: u32 = 0xff7d;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubprocessError {
    /// The pipe was closed, or failed, before the operation could finish.
    EndOfFile,
    /// A read or write was attempted on a pipe that is closing or closed.
    ClosedPipe { pipe: PipeId, op: &'static str },
    /// A read on an output pipe or a write on an input pipe.
    InvalidPipe { pipe: PipeId, op: &'static str },
    InvalidProcess(ProcessId),
    InvalidOption(String),
    /// The command does not exist or cannot be executed.
    BadExecutable(String),
    /// Process or job creation failed; nothing from the attempt stays alive.
    Spawn(String),
    /// The worker stopped before the operation settled.
    Shutdown,
}

impl SubprocessError {
    pub fn error_code(&self) -> Option<u32> {
        match self {
            SubprocessError::EndOfFile => Some(ERROR_END_OF_FILE),
            SubprocessError::InvalidPipe { .. } => Some(ERROR_INVALID_PIPE),
            SubprocessError::InvalidOption(_) => Some(ERROR_INVALID_OPTION),
            SubprocessError::BadExecutable(_) => Some(ERROR_BAD_EXECUTABLE),
            SubprocessError::ClosedPipe { .. }
            | SubprocessError::InvalidProcess(_)
            | SubprocessError::Spawn(_)
            | SubprocessError::Shutdown => None,
        }
    }
}

impl fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubprocessError::EndOfFile => write!(f, "File closed"),
            SubprocessError::ClosedPipe { op, .. } => {
                write!(f, "Attempt to {op} closed pipe")
            }
            SubprocessError::InvalidPipe { pipe, op } => {
                write!(f, "Pipe {pipe} does not support {op}")
            }
            SubprocessError::InvalidProcess(id) => write!(f, "Invalid process ID: {id}"),
            SubprocessError::InvalidOption(msg) => write!(f, "{msg}"),
            SubprocessError::BadExecutable(msg) | SubprocessError::Spawn(msg) => {
                write!(f, "{msg}")
            }
            SubprocessError::Shutdown => write!(f, "Subprocess worker shut down"),
        }
    }
}

impl std::error::Error for SubprocessError {}
