//! `MapEngine`: owns the file mapping, computes the on-disk layout,
//! constructs all segments over disjoint raw-pointer regions of the
//! mapping, routes each operation by hash, and walks segments for
//! iteration.

use crate::codec::{KeyCodec, ValueAlignment, ValueCodec};
use crate::error::{MapError, MapResult};
use crate::index::{HashIndex, IndexWord};
use crate::listener::{AbortErrorSink, DefaultValueProvider, ErrorSink, EventListener, NoFactory, NoopListener, ValueFactory};
use crate::segment::{Segment, HEADER_SIZE as SEGMENT_HEADER_SIZE};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAGIC: u32 = 0x4F46_4D50; // "OFMP"
const FORMAT_VERSION: u32 = 1;
const ENGINE_HEADER_SIZE: usize = 64;
pub const MAX_OVERSIZE: usize = 64;

/// Construction-time parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineParams {
    pub segments: u32,
    pub entries_per_segment: u32,
    pub entry_size: u32,
    pub meta_data_bytes: u32,
    pub lock_timeout: Duration,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            segments: 16,
            entries_per_segment: 4096,
            entry_size: 128,
            meta_data_bytes: 0,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

fn align64(x: usize) -> usize {
    (x + 63) & !63
}

/// Byte size of one segment (header + hash index + allocator bitset +
/// entries grid, 64-byte aligned) for a given slot width.
fn segment_bytes<W: IndexWord>(entries_per_segment: usize, entry_size: usize) -> usize {
    let hash_index_region = align64(HashIndex::<W>::slots_bytes(entries_per_segment) + HashIndex::<W>::presence_bytes(entries_per_segment));
    let alloc_region = align64(entries_per_segment.div_ceil(8));
    let entries_region = align64(entries_per_segment * entry_size);
    let mut total = SEGMENT_HEADER_SIZE + hash_index_region + alloc_region + entries_region;
    let rem = total % 4096;
    if rem < SEGMENT_HEADER_SIZE {
        total += SEGMENT_HEADER_SIZE - rem;
    }
    total
}

/// Dispatches to narrow (16-bit) or wide (32-bit) `HashIndex` slots
/// depending on `entries_per_segment`. Chosen once at construction time,
/// never branched on per operation.
enum Segments<A: ValueAlignment> {
    Narrow(Vec<Segment<u16, A>>),
    Wide(Vec<Segment<u32, A>>),
}

macro_rules! seg_call {
    ($segments:expr, $idx:expr, $method:ident $(:: < $($gen:ty),+ $(,)? >)? ($($arg:expr),* $(,)?)) => {
        match $segments {
            Segments::Narrow(v) => v[$idx].$method $(::<$($gen),+>)? ($($arg),*),
            Segments::Wide(v) => v[$idx].$method $(::<$($gen),+>)? ($($arg),*),
        }
    };
}

pub struct MapEngine<K, V, KC, VC, A = crate::codec::Align8>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
{
    mmap: MmapMut,
    segments: Segments<A>,
    segment_mask: u64,
    bits: u32,
    hash_mask: u64,
    interrupted: AtomicBool,
    sink: Box<dyn ErrorSink>,
    _marker: PhantomData<(K, V, KC, VC)>,
}

unsafe impl<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, A: ValueAlignment> Send for MapEngine<K, V, KC, VC, A> {}
unsafe impl<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, A: ValueAlignment> Sync for MapEngine<K, V, KC, VC, A> {}

impl<K, V, KC, VC, A> MapEngine<K, V, KC, VC, A>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
{
    pub fn create(path: impl AsRef<Path>, params: EngineParams) -> MapResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total = Self::total_bytes(params);
        file.set_len(total as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        Self::write_header(&mut mmap, params);
        let segments = Self::build_segments(&mut mmap, params, true)?;
        Ok(Self::assemble(mmap, segments, params))
    }

    pub fn open(path: impl AsRef<Path>, params: EngineParams) -> MapResult<Self> {
        let file: File = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let expected = Self::total_bytes(params);
        if len != expected {
            return Err(MapError::Corruption(format!(
                "file is {len} bytes, expected {expected} for the given parameters"
            )));
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        Self::validate_header(&mmap, params)?;
        let segments = Self::build_segments(&mut mmap, params, false)?;
        Ok(Self::assemble(mmap, segments, params))
    }

    fn assemble(mmap: MmapMut, segments: Segments<A>, params: EngineParams) -> Self {
        let bits = params.segments.trailing_zeros();
        let narrow = params.entries_per_segment <= 1 << 16;
        Self {
            mmap,
            segments,
            segment_mask: (params.segments - 1) as u64,
            bits,
            hash_mask: if narrow { 0xFFFF } else { 0xFFFF_FFFF },
            interrupted: AtomicBool::new(false),
            sink: Box::new(AbortErrorSink),
            _marker: PhantomData,
        }
    }

    /// Install a non-default `ErrorSink` (default is `AbortErrorSink`, which
    /// logs via `tracing`).
    pub fn set_error_sink(&mut self, sink: Box<dyn ErrorSink>) {
        self.sink = sink;
    }

    /// Request that any thread currently blocked acquiring a segment lock
    /// abort with `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    fn total_bytes(params: EngineParams) -> usize {
        let per_segment = if params.entries_per_segment <= 1 << 16 {
            segment_bytes::<u16>(params.entries_per_segment as usize, params.entry_size as usize)
        } else {
            segment_bytes::<u32>(params.entries_per_segment as usize, params.entry_size as usize)
        };
        ENGINE_HEADER_SIZE + params.segments as usize * per_segment
    }

    fn write_header(mmap: &mut MmapMut, params: EngineParams) {
        let buf = &mut mmap[..ENGINE_HEADER_SIZE];
        buf.fill(0);
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&params.segments.to_le_bytes());
        buf[12..16].copy_from_slice(&params.entries_per_segment.to_le_bytes());
        buf[16..20].copy_from_slice(&params.entry_size.to_le_bytes());
        buf[20..24].copy_from_slice(&(A::BYTES as u32).to_le_bytes());
        buf[24..28].copy_from_slice(&params.meta_data_bytes.to_le_bytes());
    }

    fn validate_header(mmap: &MmapMut, params: EngineParams) -> MapResult<()> {
        let buf = &mmap[..ENGINE_HEADER_SIZE];
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let segments = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let entries_per_segment = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let entry_size = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let alignment = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let meta_data_bytes = u32::from_le_bytes(buf[24..28].try_into().unwrap());

        if magic != MAGIC {
            return Err(MapError::Corruption("bad magic".into()));
        }
        if version != FORMAT_VERSION {
            return Err(MapError::Corruption(format!("unsupported format version {version}")));
        }
        if segments != params.segments
            || entries_per_segment != params.entries_per_segment
            || entry_size != params.entry_size
            || alignment != A::BYTES as u32
            || meta_data_bytes != params.meta_data_bytes
        {
            return Err(MapError::Corruption(
                "stored parameters do not match the parameters passed to open()".into(),
            ));
        }
        Ok(())
    }

    fn build_segments(mmap: &mut MmapMut, params: EngineParams, fresh: bool) -> MapResult<Segments<A>> {
        let base = mmap.as_mut_ptr();
        let e = params.entries_per_segment as usize;
        let b = params.entry_size as usize;
        let narrow = e <= 1 << 16;

        macro_rules! build {
            ($w:ty) => {{
                let seg_bytes = segment_bytes::<$w>(e, b);
                let hash_index_region = align64(HashIndex::<$w>::slots_bytes(e) + HashIndex::<$w>::presence_bytes(e));
                let alloc_region = align64(e.div_ceil(8));
                let mut segs = Vec::with_capacity(params.segments as usize);
                for i in 0..params.segments as usize {
                    let seg_base = unsafe { base.add(ENGINE_HEADER_SIZE + i * seg_bytes) };
                    let header = seg_base;
                    let fingerprints = unsafe { seg_base.add(SEGMENT_HEADER_SIZE) };
                    let positions = unsafe { fingerprints.add(e * <$w as IndexWord>::SIZE) };
                    let presence = unsafe { positions.add(e * <$w as IndexWord>::SIZE) };
                    let alloc_bits = unsafe { seg_base.add(SEGMENT_HEADER_SIZE + hash_index_region) };
                    let entries = unsafe { seg_base.add(SEGMENT_HEADER_SIZE + hash_index_region + alloc_region) };
                    if fresh {
                        unsafe {
                            std::ptr::write_bytes(header, 0, seg_bytes);
                            std::ptr::write_bytes(positions, 0xFF, e * <$w as IndexWord>::SIZE);
                        }
                    }
                    segs.push(unsafe {
                        Segment::<$w, A>::new(
                            header,
                            fingerprints,
                            positions,
                            presence,
                            alloc_bits,
                            entries,
                            e,
                            b,
                            params.meta_data_bytes as usize,
                            MAX_OVERSIZE,
                            params.lock_timeout,
                        )
                    });
                }
                segs
            }};
        }

        Ok(if narrow {
            Segments::Narrow(build!(u16))
        } else {
            Segments::Wide(build!(u32))
        })
    }

    fn route(&self, key: &K) -> (usize, u64) {
        let h = KC::hash(key);
        let segment_id = (h & self.segment_mask) as usize;
        let segment_hash = (h >> self.bits) & self.hash_mask;
        (segment_id, segment_hash)
    }

    pub fn put<L: EventListener<K, V>>(&mut self, key: &K, value: &V, listener: &L) -> MapResult<Option<V>> {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(segments, seg, put::<K, V, KC, VC, L>(key, value, fp, true, listener, sink, interrupted))
    }

    pub fn put_if_absent<L: EventListener<K, V>>(&mut self, key: &K, value: &V, listener: &L) -> MapResult<Option<V>> {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(segments, seg, put::<K, V, KC, VC, L>(key, value, fp, false, listener, sink, interrupted))
    }

    pub fn get(&mut self, key: &K) -> MapResult<Option<V>> {
        self.get_using(key, None, &NoopListener)
    }

    pub fn get_using<L: EventListener<K, V>>(
        &mut self,
        key: &K,
        reuse: Option<V>,
        listener: &L,
    ) -> MapResult<Option<V>> {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(
            segments,
            seg,
            acquire::<K, V, KC, VC, (), NoFactory, L>(key, reuse, fp, false, &(), &NoFactory, listener, sink, interrupted)
        )
    }

    pub fn acquire_using<DVP, VF, L>(
        &mut self,
        key: &K,
        reuse: Option<V>,
        create: bool,
        default_provider: &DVP,
        factory: &VF,
        listener: &L,
    ) -> MapResult<Option<V>>
    where
        DVP: DefaultValueProvider<K, V>,
        VF: ValueFactory<V>,
        L: EventListener<K, V>,
    {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(
            segments,
            seg,
            acquire::<K, V, KC, VC, DVP, VF, L>(key, reuse, fp, create, default_provider, factory, listener, sink, interrupted)
        )
    }

    pub fn contains_key(&mut self, key: &K) -> MapResult<bool> {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(segments, seg, contains_key::<K, KC>(key, fp, sink, interrupted))
    }

    pub fn remove(&mut self, key: &K) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        self.remove_if_listener(key, None, &NoopListener)
    }

    pub fn remove_if(&mut self, key: &K, expected: &V) -> MapResult<bool>
    where
        V: PartialEq,
    {
        Ok(self.remove_if_listener(key, Some(expected), &NoopListener)?.is_some())
    }

    fn remove_if_listener<L: EventListener<K, V>>(
        &mut self,
        key: &K,
        expected: Option<&V>,
        listener: &L,
    ) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(segments, seg, remove::<K, V, KC, VC, L>(key, expected, fp, listener, sink, interrupted))
    }

    pub fn replace(&mut self, key: &K, new_value: &V) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        self.replace_listener(key, None, new_value, &NoopListener)
    }

    pub fn replace_if(&mut self, key: &K, old: &V, new_value: &V) -> MapResult<bool>
    where
        V: PartialEq,
    {
        Ok(self.replace_listener(key, Some(old), new_value, &NoopListener)?.is_some())
    }

    fn replace_listener<L: EventListener<K, V>>(
        &mut self,
        key: &K,
        expected: Option<&V>,
        new_value: &V,
        listener: &L,
    ) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        let (seg, fp) = self.route(key);
        let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
        seg_call!(segments, seg, replace::<K, V, KC, VC, L>(key, expected, new_value, fp, listener, sink, interrupted))
    }

    pub fn clear(&mut self) -> MapResult<()> {
        let n = self.num_segments();
        for i in 0..n {
            let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
            seg_call!(segments, i, clear(sink, interrupted))?;
        }
        Ok(())
    }

    fn num_segments(&self) -> usize {
        match &self.segments {
            Segments::Narrow(v) => v.len(),
            Segments::Wide(v) => v.len(),
        }
    }

    /// Sum of per-segment live counts, clamped to `u32`.
    pub fn size(&self) -> u32 {
        self.long_size().min(u32::MAX as u64) as u32
    }

    /// Sum of per-segment live counts as a point-in-time approximation under
    /// concurrent writers.
    pub fn long_size(&self) -> u64 {
        match &self.segments {
            Segments::Narrow(v) => v.iter().map(|s| s.len() as u64).sum(),
            Segments::Wide(v) => v.iter().map(|s| s.len() as u64).sum(),
        }
    }

    /// Debug consistency check across every segment.
    pub fn check_consistency(&mut self) -> MapResult<()> {
        let n = self.num_segments();
        for i in 0..n {
            let (segments, sink, interrupted) = (&mut self.segments, self.sink.as_ref(), &self.interrupted);
            seg_call!(segments, i, check_consistency(sink, interrupted))?;
        }
        Ok(())
    }

    /// Closing is idempotent at the OS level (unmap-on-drop); operations
    /// after `close` are undefined.
    pub fn close(self) {
        drop(self);
    }

    pub fn entry_iterator(&mut self) -> EntryIterator<'_, K, V, KC, VC, A>
    where
        K: Clone,
    {
        EntryIterator::new(self)
    }
}

/// Walks segments highest-to-lowest, and within each segment the
/// `HashIndex` presence bitmap in ascending position order.
pub struct EntryIterator<'e, K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, A: ValueAlignment> {
    engine: &'e mut MapEngine<K, V, KC, VC, A>,
    segment_idx: isize,
    positions: Vec<usize>,
    pos_idx: usize,
    last: Option<(K, usize)>,
}

impl<'e, K, V, KC, VC, A> EntryIterator<'e, K, V, KC, VC, A>
where
    KC: KeyCodec<K>,
    VC: ValueCodec<V>,
    A: ValueAlignment,
    K: Clone,
{
    fn new(engine: &'e mut MapEngine<K, V, KC, VC, A>) -> Self {
        let top = engine.num_segments() as isize - 1;
        Self {
            engine,
            segment_idx: top,
            positions: Vec::new(),
            pos_idx: 0,
            last: None,
        }
    }

    fn refill(&mut self) -> MapResult<()> {
        while self.pos_idx >= self.positions.len() {
            if self.segment_idx < 0 {
                return Ok(());
            }
            let idx = self.segment_idx as usize;
            let engine = &mut *self.engine;
            let (segments, sink, interrupted) = (&mut engine.segments, engine.sink.as_ref(), &engine.interrupted);
            self.positions = seg_call!(segments, idx, positions(sink, interrupted))?;
            self.pos_idx = 0;
            self.segment_idx -= 1;
        }
        Ok(())
    }

    /// Next `(key, value)`, or `None` at end of iteration. May skip a
    /// position concurrently vacated between the scan and the re-check
    /// under lock.
    pub fn next(&mut self) -> MapResult<Option<(K, V)>> {
        loop {
            self.refill()?;
            if self.pos_idx >= self.positions.len() {
                return Ok(None);
            }
            let pos = self.positions[self.pos_idx];
            self.pos_idx += 1;
            let seg_idx = (self.segment_idx + 1) as usize;
            let engine = &mut *self.engine;
            let (segments, sink, interrupted) = (&mut engine.segments, engine.sink.as_ref(), &engine.interrupted);
            let found = seg_call!(segments, seg_idx, read_at::<K, V, KC, VC>(pos, sink, interrupted))?;
            if let Some((key, value)) = found {
                self.last = Some((key.clone(), pos));
                return Ok(Some((key, value)));
            }
            // Position was vacated by a concurrent writer before we reached it; skip it.
        }
    }

    /// Remove the entry most recently returned by `next`.
    pub fn remove(&mut self) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        let (key, pos) = match self.last.take() {
            Some(pair) => pair,
            None => return Ok(None),
        };
        let (seg, fp) = self.engine.route(&key);
        let via_position = {
            let engine = &mut *self.engine;
            let (segments, sink, interrupted) = (&mut engine.segments, engine.sink.as_ref(), &engine.interrupted);
            seg_call!(
                segments,
                seg,
                remove_at::<K, V, KC, VC, NoopListener>(pos, &key, fp, &NoopListener, sink, interrupted)
            )?
        };
        match via_position {
            Some(v) => Ok(Some(v)),
            // The snapshotted position no longer holds this key (relocated
            // or removed already); fall back to a full lookup by key.
            None => self.engine.remove(&key),
        }
    }
}
