//! `MapBuilder`: the construction/configuration surface, the fluent entry
//! point a caller uses to assemble an `EngineParams` and produce a mapped
//! `MapEngine`.

use crate::codec::{Align8, KeyCodec, ValueAlignment, ValueCodec};
use crate::engine::{EngineParams, MapEngine};
use crate::error::MapResult;
use crate::listener::{AbortErrorSink, ErrorSink};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builds a `MapEngine<K, V, KC, VC, A>` over a memory-mapped file.
///
/// Defaults: `entry_size` 128, `alignment` 8 bytes, `meta_data_bytes` 0,
/// `lock_timeout` 2s, 16 segments of 4096 entries each.
pub struct MapBuilder<K, V, KC, VC, A = Align8>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
{
    params: EngineParams,
    sink: Option<Box<dyn ErrorSink>>,
    _marker: PhantomData<(K, V, KC, VC, A)>,
}

impl<K, V, KC, VC, A> Default for MapBuilder<K, V, KC, VC, A>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
{
    fn default() -> Self {
        Self {
            params: EngineParams::default(),
            sink: None,
            _marker: PhantomData,
        }
    }
}

impl<K, V, KC, VC, A> MapBuilder<K, V, KC, VC, A>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be a power of two.
    pub fn segments(mut self, segments: u32) -> Self {
        assert!(segments.is_power_of_two(), "segments must be a power of two");
        self.params.segments = segments;
        self
    }

    /// Must be a multiple of 8.
    pub fn entries_per_segment(mut self, entries_per_segment: u32) -> Self {
        assert!(entries_per_segment % 8 == 0, "entries_per_segment must be a multiple of 8");
        self.params.entries_per_segment = entries_per_segment;
        self
    }

    pub fn entry_size(mut self, entry_size: u32) -> Self {
        self.params.entry_size = entry_size;
        self
    }

    pub fn meta_data_bytes(mut self, meta_data_bytes: u32) -> Self {
        self.params.meta_data_bytes = meta_data_bytes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.params.lock_timeout = timeout;
        self
    }

    pub fn error_sink(mut self, sink: Box<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn into_engine(self, engine: MapEngine<K, V, KC, VC, A>) -> MapEngine<K, V, KC, VC, A> {
        let mut engine = engine;
        if let Some(sink) = self.sink {
            engine.set_error_sink(sink);
        } else {
            engine.set_error_sink(Box::new(AbortErrorSink));
        }
        engine
    }

    /// Create a fresh backing file at `path`, truncating any existing
    /// contents, and map it.
    pub fn create(self, path: impl AsRef<Path>) -> MapResult<MapEngine<K, V, KC, VC, A>> {
        let params = self.params;
        let path: PathBuf = path.as_ref().to_path_buf();
        let engine = MapEngine::create(&path, params)?;
        Ok(self.into_engine(engine))
    }

    /// Reopen an existing backing file, validating its header against this
    /// builder's parameters.
    pub fn open(self, path: impl AsRef<Path>) -> MapResult<MapEngine<K, V, KC, VC, A>> {
        let params = self.params;
        let path: PathBuf = path.as_ref().to_path_buf();
        let engine = MapEngine::open(&path, params)?;
        Ok(self.into_engine(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Align1, BytesCodec};

    #[test]
    fn default_params_match_spec_defaults() {
        let b: MapBuilder<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1> = MapBuilder::new();
        assert_eq!(b.params.entry_size, 128);
        assert_eq!(b.params.meta_data_bytes, 0);
        assert_eq!(b.params.lock_timeout, Duration::from_secs(2));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_segments() {
        let _: MapBuilder<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1> =
            MapBuilder::new().segments(3);
    }
}
