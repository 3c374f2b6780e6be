//! Completion keys for the shared completion port.
//!
//! One port carries pipe I/O completions, job notifications, and wake-ups
//! posted by the controlling thread. Every key is a single machine word: the
//! two high tag bits name the kind of target, the low bits carry its id, and
//! the untagged value [`WAKE_KEY`] is reserved for wake-ups.

use serde::{Deserialize, Serialize};
use std::fmt;

const KEY_IS_PIPE: usize = 1 << 31;
const KEY_IS_PROCESS: usize = 1 << 30;
const KEY_TAG_MASK: usize = KEY_IS_PIPE | KEY_IS_PROCESS;
const KEY_ID_MASK: usize = KEY_IS_PROCESS - 1;

/// Largest id either kind may take; ids must never reach into the tag bits.
pub const MAX_ID: u32 = KEY_ID_MASK as u32;

/// Key posted by the controlling thread to wake the worker.
pub const WAKE_KEY: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a dequeued completion key refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionTarget {
    Pipe(PipeId),
    Process(ProcessId),
    Wake,
    /// A key this worker never handed out.
    Unknown(usize),
}

impl CompletionTarget {
    pub fn encode(self) -> usize {
        match self {
            CompletionTarget::Pipe(PipeId(id)) => KEY_IS_PIPE | (id as usize & KEY_ID_MASK),
            CompletionTarget::Process(ProcessId(id)) => {
                KEY_IS_PROCESS | (id as usize & KEY_ID_MASK)
            }
            CompletionTarget::Wake => WAKE_KEY,
            CompletionTarget::Unknown(key) => key,
        }
    }

    pub fn decode(key: usize) -> Self {
        if key == WAKE_KEY {
            return CompletionTarget::Wake;
        }
        let id = (key & KEY_ID_MASK) as u32;
        match key & !KEY_ID_MASK {
            KEY_IS_PIPE => CompletionTarget::Pipe(PipeId(id)),
            KEY_IS_PROCESS => CompletionTarget::Process(ProcessId(id)),
            _ => CompletionTarget::Unknown(key),
        }
    }
}

impl PipeId {
    pub fn completion_key(self) -> usize {
        CompletionTarget::Pipe(self).encode()
    }
}

impl ProcessId {
    pub fn completion_key(self) -> usize {
        CompletionTarget::Process(self).encode()
    }
}

/// Hands out pipe and process ids. Ids only grow, so an id is never reused
/// while the worker lives.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_pipe: u32,
    next_process: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_pipe(&mut self) -> Option<PipeId> {
        let id = Self::bump(&mut self.next_pipe)?;
        Some(PipeId(id))
    }

    pub fn next_process(&mut self) -> Option<ProcessId> {
        let id = Self::bump(&mut self.next_process)?;
        Some(ProcessId(id))
    }

    /// True when `id` was handed out at some point.
    pub fn pipe_allocated(&self, id: PipeId) -> bool {
        id.0 < self.next_pipe
    }

    fn bump(counter: &mut u32) -> Option<u32> {
        let id = *counter;
        if id > MAX_ID {
            return None;
        }
        *counter = id + 1;
        Some(id)
    }
}
