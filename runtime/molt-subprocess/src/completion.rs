//! One-shot settlement of caller-visible results.
//!
//! Each queued read, write, close, or exit wait carries a [`Resolver`]. The
//! worker settles it from the dispatch loop; the other side is either a
//! callback (the worker forwards results as response messages) or a
//! [`Promise`] backed by a one-slot channel.

use crate::error::SubprocessError;
use crossbeam_channel::{Receiver, TryRecvError, bounded};

pub type Settled<T> = Result<T, SubprocessError>;

pub struct Resolver<T> {
    sink: Box<dyn FnOnce(Settled<T>)>,
}

impl<T: 'static> Resolver<T> {
    pub fn new<F>(sink: F) -> Self
    where
        F: FnOnce(Settled<T>) + 'static,
    {
        Self {
            sink: Box::new(sink),
        }
    }

    /// A resolver that discards its result.
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    pub fn resolve(self, value: T) {
        (self.sink)(Ok(value));
    }

    pub fn reject(self, err: SubprocessError) {
        (self.sink)(Err(err));
    }

}

/// Receiving side of [`promise`].
pub struct Promise<T> {
    rx: Receiver<Settled<T>>,
}

pub fn promise<T: Send + 'static>() -> (Resolver<T>, Promise<T>) {
    let (tx, rx) = bounded(1);
    let resolver = Resolver::new(move |result| {
        let _ = tx.try_send(result);
    });
    (resolver, Promise { rx })
}

impl<T> Promise<T> {
    /// Returns the result if it has been settled. A resolver dropped without
    /// settling reads as [`SubprocessError::Shutdown`].
    pub fn try_take(&self) -> Option<Settled<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SubprocessError::Shutdown)),
        }
    }
}
