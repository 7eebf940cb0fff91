use std::io;
use thiserror::Error;

/// Error kinds surfaced by the engine.
///
/// `LockTimeout` is notified to the configured `ErrorSink` and then
/// recovered internally (the waiter retries after the dead holder's lock
/// word is forcibly reset) — callers normally never observe it directly,
/// but it is a real variant: `Segment::acquire` returns it if a caller
/// needs to distinguish a stuck lock from other failures.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("key or value of unexpected type")]
    TypeMismatch,

    #[error("lock not acquired within {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("thread interrupted while waiting for segment lock")]
    Interrupted,

    #[error("segment has no room for an entry spanning {0} blocks")]
    SegmentFull(usize),

    #[error("value requires {0} blocks, exceeding max_oversize")]
    ValueTooLarge(usize),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("consistency check failed: {0}")]
    Corruption(String),

    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type MapResult<T> = Result<T, MapError>;
