//! An embedded, persistent, concurrent key-value map whose entire
//! representation lives in a memory-mapped file region: a fixed number of
//! independently locked segments, each a bitset allocator over a block
//! grid, a fingerprint hash index, and a raw entries grid addressed by
//! offsets computed from the entry codec — so that multiple processes or
//! threads mapping the same file observe the same state.
//!
//! Start with [`MapBuilder`] to create or reopen a backing file, then drive
//! the resulting [`MapEngine`] with `put`/`get`/`remove`/`replace` and the
//! rest of the public surface.

pub mod alloc;
pub mod builder;
pub mod codec;
pub mod engine;
pub mod entry;
pub mod error;
pub mod index;
pub mod listener;
pub mod lock;
pub mod segment;

pub use builder::MapBuilder;
pub use codec::{Align1, Align4, Align8, BytesCodec, KeyCodec, StringCodec, ValueAlignment, ValueCodec};
pub use engine::{EngineParams, EntryIterator, MapEngine};
pub use error::{MapError, MapResult};
pub use listener::{AbortErrorSink, Byteable, DefaultValueProvider, ErrorSink, EventListener, NoopListener, ValueFactory};
