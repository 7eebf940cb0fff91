//! `Segment`: one independently locked partition of the map.
//! Owns a 64-byte header (lock word + live count + reserved), the
//! `HashIndex` storage, the `BlockAllocator`'s bitset, and the entries
//! grid — all as raw-pointer views into the shared mapping (value-typed,
//! `unsafe impl Send + Sync`, single lock/owner disciplines synchronization
//! instead of the borrow checker).

use crate::alloc::BlockAllocator;
use crate::codec::{KeyCodec, ValueAlignment, ValueCodec};
use crate::entry::{self, blocks, EntryLayout};
use crate::error::{MapError, MapResult};
use crate::index::{HashIndex, IndexWord};
use crate::listener::{DefaultValueProvider, ErrorSink, EventListener, ValueFactory};
use crate::lock::SegmentLock;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

pub const HEADER_SIZE: usize = 64;

pub struct Segment<W: IndexWord, A: ValueAlignment> {
    lock: SegmentLock,
    count: *mut u32,
    index: HashIndex<W>,
    allocator: BlockAllocator,
    entries: *mut u8,
    entries_per_segment: usize,
    entry_size: usize,
    meta_data_bytes: usize,
    max_oversize: usize,
    lock_timeout: Duration,
    _align: PhantomData<A>,
}

unsafe impl<W: IndexWord, A: ValueAlignment> Send for Segment<W, A> {}
unsafe impl<W: IndexWord, A: ValueAlignment> Sync for Segment<W, A> {}

impl<W: IndexWord, A: ValueAlignment> Segment<W, A> {
    /// `header` must point to `HEADER_SIZE` bytes; `fingerprints`/
    /// `positions`/`presence` to the HashIndex region; `alloc_bits` to
    /// `ceil(entries_per_segment/8)` bytes; `entries` to
    /// `entries_per_segment * entry_size` bytes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        header: *mut u8,
        fingerprints: *mut u8,
        positions: *mut u8,
        presence: *mut u8,
        alloc_bits: *mut u8,
        entries: *mut u8,
        entries_per_segment: usize,
        entry_size: usize,
        meta_data_bytes: usize,
        max_oversize: usize,
        lock_timeout: Duration,
    ) -> Self {
        let lock = SegmentLock::new(header);
        let count = header.add(8) as *mut u32;
        let index = HashIndex::new(fingerprints, positions, presence, entries_per_segment);
        let allocator = BlockAllocator::new(alloc_bits, entries_per_segment);
        Self {
            lock,
            count,
            index,
            allocator,
            entries,
            entries_per_segment,
            entry_size,
            meta_data_bytes,
            max_oversize,
            lock_timeout,
            _align: PhantomData,
        }
    }

    pub fn len(&self) -> u32 {
        unsafe { (*(self.count as *const AtomicU32)).load(Ordering::Acquire) }
    }

    fn bump_count(&self, delta: i64) {
        let counter = unsafe { &*(self.count as *const AtomicU32) };
        if delta >= 0 {
            counter.fetch_add(delta as u32, Ordering::Release);
        } else {
            counter.fetch_sub((-delta) as u32, Ordering::Release);
        }
    }

    fn max_entry_bytes(&self, pos: usize) -> usize {
        (self.entries_per_segment - pos).min(self.max_oversize) * self.entry_size
    }

    fn entry_slice(&self, pos: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.entries.add(pos * self.entry_size), self.max_entry_bytes(pos)) }
    }

    #[allow(clippy::mut_from_ref)]
    fn entry_slice_mut(&self, pos: usize) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.entries.add(pos * self.entry_size), self.max_entry_bytes(pos))
        }
    }

    fn acquire(&self, interrupted: &AtomicBool, sink: &dyn ErrorSink) -> MapResult<()> {
        self.lock.acquire(self.lock_timeout, interrupted, sink)
    }

    fn release(&self) {
        self.lock.release();
    }

    /// Find the slot bound to `fingerprint` whose entry's key matches.
    /// Leaves the `HashIndex` search cursor positioned on the match (if
    /// any) so `replace_prev_pos`/`remove_prev_pos` remain valid.
    fn find_matching<K, KC: KeyCodec<K>>(
        &mut self,
        key: &K,
        fingerprint: u64,
    ) -> Option<(usize, EntryLayout)> {
        self.index.start_search(fingerprint);
        while let Some(pos) = self.index.next_pos() {
            let buf = self.entry_slice(pos);
            let layout = entry::read_layout::<A>(buf, self.meta_data_bytes);
            if entry::key_matches::<K, KC>(buf, &layout, key) {
                return Some((pos, layout));
            }
        }
        None
    }

    fn put_entry<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>>(
        &mut self,
        key: &K,
        value: &V,
    ) -> MapResult<usize> {
        let total = entry::sizeof_entry::<K, V, KC, VC, A>(self.meta_data_bytes, key, value);
        let n = blocks(total, self.entry_size);
        if n > self.max_oversize {
            return Err(MapError::ValueTooLarge(n));
        }
        let pos = self.allocator.alloc(n, self.max_oversize)?;
        let buf = self.entry_slice_mut(pos);
        entry::write_entry::<K, V, KC, VC, A>(buf, self.meta_data_bytes, key, value);
        Ok(pos)
    }

    /// Overwrite in place, shrink, extend in place, or relocate, depending
    /// on how the new value's block footprint compares to the old one.
    fn replace_value_in_place_or_relocate<V, VC: ValueCodec<V>>(
        &mut self,
        pos: usize,
        old_layout: &EntryLayout,
        new_value: &V,
    ) -> MapResult<(usize, EntryLayout, Option<usize>)> {
        let key_end = old_layout.key_end();
        let old_blocks = blocks(old_layout.entry_end, self.entry_size);
        let new_value_size = VC::encoded_size(new_value);
        let new_end = entry::entry_end_for_value::<A>(key_end, new_value_size);
        let new_blocks = blocks(new_end, self.entry_size);

        if new_blocks == old_blocks {
            let buf = self.entry_slice_mut(pos);
            entry::overwrite_value::<V, VC, A>(buf, key_end, new_value);
            let layout = entry::read_layout::<A>(self.entry_slice(pos), self.meta_data_bytes);
            return Ok((pos, layout, None));
        }

        if new_blocks < old_blocks {
            let buf = self.entry_slice_mut(pos);
            entry::overwrite_value::<V, VC, A>(buf, key_end, new_value);
            self.allocator.shrink(pos, old_blocks, new_blocks);
            let layout = entry::read_layout::<A>(self.entry_slice(pos), self.meta_data_bytes);
            return Ok((pos, layout, None));
        }

        if new_blocks > self.max_oversize {
            return Err(MapError::ValueTooLarge(new_blocks));
        }

        if self.allocator.realloc_extend(pos, old_blocks, new_blocks) {
            let buf = self.entry_slice_mut(pos);
            entry::overwrite_value::<V, VC, A>(buf, key_end, new_value);
            let layout = entry::read_layout::<A>(self.entry_slice(pos), self.meta_data_bytes);
            return Ok((pos, layout, None));
        }

        // Relocate: allocate the fresh run first, while the old run is still
        // marked occupied, so a failed allocation leaves the old run, the
        // index, and the entry bytes all untouched. Only once the new run
        // exists do we free the old one and rebind the index to it.
        let new_pos = self.allocator.alloc(new_blocks, self.max_oversize)?;
        self.allocator.free(pos, old_blocks);
        self.index.replace_prev_pos(new_pos);

        let prefix: Vec<u8> = self.entry_slice(pos)[..key_end].to_vec();
        let new_buf = self.entry_slice_mut(new_pos);
        new_buf[..key_end].copy_from_slice(&prefix);
        entry::overwrite_value::<V, VC, A>(new_buf, key_end, new_value);
        let layout = entry::read_layout::<A>(self.entry_slice(new_pos), self.meta_data_bytes);
        Ok((new_pos, layout, Some(pos)))
    }

    /// Insert or, if the key is already present and `replace_if_present`,
    /// overwrite its value.
    #[allow(clippy::too_many_arguments)]
    pub fn put<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, L: EventListener<K, V>>(
        &mut self,
        key: &K,
        value: &V,
        fingerprint: u64,
        replace_if_present: bool,
        listener: &L,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<V>> {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<Option<V>> {
            match self.find_matching::<K, KC>(key, fingerprint) {
                Some((pos, layout)) => {
                    let prev: V = entry::read_value::<V, VC>(self.entry_slice(pos), &layout);
                    if !replace_if_present {
                        return Ok(Some(prev));
                    }
                    let (final_pos, _layout, relocated_from) =
                        self.replace_value_in_place_or_relocate::<V, VC>(pos, &layout, value)?;
                    if let Some(old_pos) = relocated_from {
                        listener.on_relocation(old_pos);
                    }
                    listener.on_put(false, key, value, final_pos);
                    Ok(Some(prev))
                }
                None => {
                    let pos = self.put_entry::<K, V, KC, VC>(key, value)?;
                    self.index.put_after_failed_search(pos)?;
                    self.bump_count(1);
                    listener.on_put(true, key, value, pos);
                    Ok(None)
                }
            }
        })();
        self.release();
        result
    }

    /// Get the value for `key`, or, when absent, fall back to a default
    /// provider or (if `create`) seed one via `using_value`/`factory`.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire<K, V, KC, VC, DVP, VF, L>(
        &mut self,
        key: &K,
        using_value: Option<V>,
        fingerprint: u64,
        create: bool,
        default_provider: &DVP,
        factory: &VF,
        listener: &L,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<V>>
    where
        KC: KeyCodec<K>,
        VC: ValueCodec<V>,
        DVP: DefaultValueProvider<K, V>,
        VF: ValueFactory<V>,
        L: EventListener<K, V>,
    {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<Option<V>> {
            match self.find_matching::<K, KC>(key, fingerprint) {
                Some((pos, layout)) => {
                    let value: V = entry::read_value::<V, VC>(self.entry_slice(pos), &layout);
                    listener.on_get(key, &value);
                    Ok(Some(value))
                }
                None if !create => match default_provider.get(key) {
                    None => Ok(None),
                    Some(value) => {
                        let pos = self.put_entry::<K, V, KC, VC>(key, &value)?;
                        self.index.put_after_failed_search(pos)?;
                        self.bump_count(1);
                        listener.on_put(true, key, &value, pos);
                        Ok(Some(value))
                    }
                },
                None => {
                    let using_value_passed = using_value.is_some();
                    let value = using_value.unwrap_or_else(|| factory.create());
                    let pos = self.put_entry::<K, V, KC, VC>(key, &value)?;
                    self.index.put_after_failed_search(pos)?;
                    self.bump_count(1);
                    // A value built by the factory (not supplied by the
                    // caller) does not fire the on_put notification.
                    if using_value_passed {
                        listener.on_put(true, key, &value, pos);
                    }
                    Ok(Some(value))
                }
            }
        })();
        self.release();
        result
    }

    /// Remove `key`, optionally only if its current value equals
    /// `expected_value`.
    pub fn remove<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, L: EventListener<K, V>>(
        &mut self,
        key: &K,
        expected_value: Option<&V>,
        fingerprint: u64,
        listener: &L,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<Option<V>> {
            match self.find_matching::<K, KC>(key, fingerprint) {
                Some((pos, layout)) => {
                    let value: V = entry::read_value::<V, VC>(self.entry_slice(pos), &layout);
                    if let Some(expected) = expected_value {
                        if *expected != value {
                            return Ok(None);
                        }
                    }
                    self.index.remove_prev_pos();
                    self.allocator
                        .free(pos, blocks(layout.entry_end, self.entry_size));
                    self.bump_count(-1);
                    listener.on_remove(key, &value, pos);
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })();
        self.release();
        result
    }

    /// Replace `key`'s value with `new_value`, optionally only if its
    /// current value equals `expected`.
    pub fn replace<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, L: EventListener<K, V>>(
        &mut self,
        key: &K,
        expected: Option<&V>,
        new_value: &V,
        fingerprint: u64,
        listener: &L,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<V>>
    where
        V: PartialEq,
    {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<Option<V>> {
            match self.find_matching::<K, KC>(key, fingerprint) {
                Some((pos, layout)) => {
                    let current: V = entry::read_value::<V, VC>(self.entry_slice(pos), &layout);
                    if let Some(expected) = expected {
                        if *expected != current {
                            return Ok(None);
                        }
                    }
                    let (final_pos, _layout, relocated_from) =
                        self.replace_value_in_place_or_relocate::<V, VC>(pos, &layout, new_value)?;
                    if let Some(old_pos) = relocated_from {
                        listener.on_relocation(old_pos);
                    }
                    listener.on_put(false, key, new_value, final_pos);
                    Ok(Some(current))
                }
                None => Ok(None),
            }
        })();
        self.release();
        result
    }

    pub fn contains_key<K, KC: KeyCodec<K>>(
        &mut self,
        key: &K,
        fingerprint: u64,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<bool> {
        self.acquire(interrupted, sink)?;
        let found = self.find_matching::<K, KC>(key, fingerprint).is_some();
        self.release();
        Ok(found)
    }

    pub fn clear(&mut self, sink: &dyn ErrorSink, interrupted: &AtomicBool) -> MapResult<()> {
        self.acquire(interrupted, sink)?;
        self.index.clear_all();
        self.allocator.clear_all();
        unsafe { (*(self.count as *const AtomicU32)).store(0, Ordering::Release) };
        self.release();
        Ok(())
    }

    /// Read the value currently stored at `pos`, re-checking presence
    /// under the lock first (used by the entry iterator).
    pub fn read_at<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>>(
        &mut self,
        pos: usize,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<(K, V)>> {
        self.acquire(interrupted, sink)?;
        let result = if self.allocator.is_set(pos) {
            let buf = self.entry_slice(pos);
            let layout = entry::read_layout::<A>(buf, self.meta_data_bytes);
            let key = entry::read_key::<K, KC>(buf, &layout);
            let value = entry::read_value::<V, VC>(buf, &layout);
            Some((key, value))
        } else {
            None
        };
        self.release();
        Ok(result)
    }

    /// Remove by position, recomputing the fingerprint from `key` (used by
    /// the entry iterator). Returns the removed value if the
    /// position was still occupied by an entry whose key matches.
    pub fn remove_at<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, L: EventListener<K, V>>(
        &mut self,
        pos: usize,
        expected_key: &K,
        fingerprint: u64,
        listener: &L,
        sink: &dyn ErrorSink,
        interrupted: &AtomicBool,
    ) -> MapResult<Option<V>> {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<Option<V>> {
            if !self.allocator.is_set(pos) {
                return Ok(None);
            }
            let buf = self.entry_slice(pos);
            let layout = entry::read_layout::<A>(buf, self.meta_data_bytes);
            if !entry::key_matches::<K, KC>(buf, &layout, expected_key) {
                return Ok(None);
            }
            // Re-run the search so the HashIndex cursor lands on this exact pair.
            self.index.start_search(fingerprint);
            let mut hit = false;
            while let Some(p) = self.index.next_pos() {
                if p == pos {
                    hit = true;
                    break;
                }
            }
            if !hit {
                return Ok(None);
            }
            let value: V = entry::read_value::<V, VC>(self.entry_slice(pos), &layout);
            self.index.remove_prev_pos();
            self.allocator
                .free(pos, blocks(layout.entry_end, self.entry_size));
            self.bump_count(-1);
            listener.on_remove(expected_key, &value, pos);
            Ok(Some(value))
        })();
        self.release();
        result
    }

    pub fn positions(&mut self, sink: &dyn ErrorSink, interrupted: &AtomicBool) -> MapResult<Vec<usize>> {
        self.acquire(interrupted, sink)?;
        let positions = self.index.positions();
        self.release();
        Ok(positions)
    }

    /// Walk the allocator bitset and hash index together, checking that
    /// every live first-block has exactly one index entry and every free
    /// block has none.
    pub fn check_consistency(&mut self, sink: &dyn ErrorSink, interrupted: &AtomicBool) -> MapResult<()> {
        self.acquire(interrupted, sink)?;
        let result = (|| -> MapResult<()> {
            let mut index_counts = vec![0u32; self.entries_per_segment];
            self.index.for_each(|_fp, pos| {
                if pos < index_counts.len() {
                    index_counts[pos] += 1;
                }
            });

            let mut p = 0;
            while p < self.entries_per_segment {
                if self.allocator.is_set(p) {
                    if index_counts[p] != 1 {
                        return Err(MapError::Corruption(format!(
                            "block {p} is a live first-block but has {} hash-index entries",
                            index_counts[p]
                        )));
                    }
                    let buf = self.entry_slice(p);
                    let layout = entry::read_layout::<A>(buf, self.meta_data_bytes);
                    let n = blocks(layout.entry_end, self.entry_size);
                    for i in (p + 1)..(p + n).min(self.entries_per_segment) {
                        if self.allocator.is_set(i) {
                            return Err(MapError::Corruption(format!(
                                "block {i} lies inside entry at {p} but is independently marked first-block"
                            )));
                        }
                    }
                    p += n;
                } else {
                    if index_counts[p] != 0 {
                        return Err(MapError::Corruption(format!(
                            "block {p} is free but has {} hash-index entries",
                            index_counts[p]
                        )));
                    }
                    p += 1;
                }
            }
            Ok(())
        })();
        self.release();
        result
    }
}
