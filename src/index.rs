//! `HashIndex`: the per-segment multi-map from hash fingerprint to block
//! position. Backed by a fixed-size, open-addressed array of
//! `(fingerprint, position)` slots with linear probing, plus a
//! presence bitmap indexed by *position* (not slot) for fast ascending
//! iteration.
//!
//! Search/insert/remove/replace form a cursor-op contract: the cursor is
//! valid only between `start_search` and the enclosing segment unlock.

use crate::error::{MapError, MapResult};

/// A fixed-width slot value: `u16` in narrow mode, `u32` in wide mode.
/// Narrow mode is picked when the number of entries fits in a `u16`.
pub trait IndexWord: Copy + Eq + std::fmt::Debug {
    const SIZE: usize;
    const EMPTY: Self;
    fn from_u64(v: u64) -> Self;
    fn as_usize(self) -> usize;
    fn from_usize(v: usize) -> Self;
    unsafe fn read_at(ptr: *const u8, slot: usize) -> Self;
    unsafe fn write_at(ptr: *mut u8, slot: usize, v: Self);
}

impl IndexWord for u16 {
    const SIZE: usize = 2;
    const EMPTY: Self = u16::MAX;
    fn from_u64(v: u64) -> Self {
        v as u16
    }
    fn as_usize(self) -> usize {
        self as usize
    }
    fn from_usize(v: usize) -> Self {
        v as u16
    }
    unsafe fn read_at(ptr: *const u8, slot: usize) -> Self {
        (ptr as *const u16).add(slot).read_unaligned()
    }
    unsafe fn write_at(ptr: *mut u8, slot: usize, v: Self) {
        (ptr as *mut u16).add(slot).write_unaligned(v)
    }
}

impl IndexWord for u32 {
    const SIZE: usize = 4;
    const EMPTY: Self = u32::MAX;
    fn from_u64(v: u64) -> Self {
        v as u32
    }
    fn as_usize(self) -> usize {
        self as usize
    }
    fn from_usize(v: usize) -> Self {
        v as u32
    }
    unsafe fn read_at(ptr: *const u8, slot: usize) -> Self {
        (ptr as *const u32).add(slot).read_unaligned()
    }
    unsafe fn write_at(ptr: *mut u8, slot: usize, v: Self) {
        (ptr as *mut u32).add(slot).write_unaligned(v)
    }
}

/// Valid between `start_search` and the next unlock; not durable.
struct SearchCursor<W> {
    fingerprint: W,
    probe: usize,
    probes_done: usize,
    last_slot: Option<usize>,
    insertion_slot: Option<usize>,
    exhausted: bool,
}

pub struct HashIndex<W: IndexWord> {
    fingerprints: *mut u8,
    positions: *mut u8,
    presence: *mut u8,
    num_slots: usize,
    cursor: Option<SearchCursor<W>>,
}

unsafe impl<W: IndexWord> Send for HashIndex<W> {}
unsafe impl<W: IndexWord> Sync for HashIndex<W> {}

impl<W: IndexWord> HashIndex<W> {
    /// Bytes required for the slot arrays alone (fingerprints + positions),
    /// excluding the presence bitmap.
    pub fn slots_bytes(num_slots: usize) -> usize {
        num_slots * W::SIZE * 2
    }

    /// Bytes required for the position-indexed presence bitmap.
    pub fn presence_bytes(num_slots: usize) -> usize {
        num_slots.div_ceil(8)
    }

    /// `fingerprints`/`positions` must each point to `slots_bytes`-worth
    /// of distinct storage (actually `num_slots * W::SIZE` each); `presence`
    /// must point to `presence_bytes(num_slots)` bytes.
    pub unsafe fn new(
        fingerprints: *mut u8,
        positions: *mut u8,
        presence: *mut u8,
        num_slots: usize,
    ) -> Self {
        Self {
            fingerprints,
            positions,
            presence,
            num_slots,
            cursor: None,
        }
    }

    #[inline(always)]
    unsafe fn fp_at(&self, slot: usize) -> W {
        W::read_at(self.fingerprints, slot)
    }
    #[inline(always)]
    unsafe fn pos_at(&self, slot: usize) -> W {
        W::read_at(self.positions, slot)
    }
    #[inline(always)]
    unsafe fn set_slot(&self, slot: usize, fp: W, pos: W) {
        W::write_at(self.fingerprints, slot, fp);
        W::write_at(self.positions, slot, pos);
    }
    #[inline(always)]
    unsafe fn clear_slot(&self, slot: usize) {
        W::write_at(self.positions, slot, W::EMPTY);
    }

    fn presence_set(&self, pos: usize, value: bool) {
        unsafe {
            let ptr = self.presence.add(pos / 8);
            let byte = ptr.read();
            let mask = 1u8 << (pos % 8);
            ptr.write(if value { byte | mask } else { byte & !mask });
        }
    }

    fn presence_get(&self, pos: usize) -> bool {
        unsafe {
            let byte = self.presence.add(pos / 8).read();
            (byte >> (pos % 8)) & 1 != 0
        }
    }

    /// Reset the search cursor for `fingerprint`.
    pub fn start_search(&mut self, fingerprint: u64) {
        let fp = W::from_u64(fingerprint);
        let home = fp.as_usize() % self.num_slots;
        self.cursor = Some(SearchCursor {
            fingerprint: fp,
            probe: home,
            probes_done: 0,
            last_slot: None,
            insertion_slot: None,
            exhausted: false,
        });
    }

    /// Yield the next position bound to the active fingerprint, or `None`
    /// when the probe chain is exhausted.
    pub fn next_pos(&mut self) -> Option<usize> {
        loop {
            let cursor = self.cursor.as_mut().expect("next_pos without start_search");
            if cursor.exhausted {
                return None;
            }
            if cursor.probes_done >= self.num_slots {
                cursor.exhausted = true;
                cursor.insertion_slot = None;
                return None;
            }
            let slot = cursor.probe;
            let stored_pos = unsafe { self.pos_at(slot) };
            if stored_pos == W::EMPTY {
                cursor.exhausted = true;
                cursor.insertion_slot = Some(slot);
                return None;
            }
            cursor.probe = (cursor.probe + 1) % self.num_slots;
            cursor.probes_done += 1;
            let stored_fp = unsafe { self.fp_at(slot) };
            if stored_fp == cursor.fingerprint {
                cursor.last_slot = Some(slot);
                return Some(stored_pos.as_usize());
            }
        }
    }

    /// Insert `(fingerprint, pos)` using the insertion point established by
    /// the preceding exhausted search.
    pub fn put_after_failed_search(&mut self, pos: usize) -> MapResult<()> {
        let cursor = self
            .cursor
            .as_ref()
            .expect("put_after_failed_search without start_search");
        let slot = cursor
            .insertion_slot
            .ok_or(MapError::IllegalState("hash index has no free slot"))?;
        let fp = cursor.fingerprint;
        unsafe { self.set_slot(slot, fp, W::from_usize(pos)) };
        self.presence_set(pos, true);
        Ok(())
    }

    /// Delete the `(fingerprint, pos)` pair most recently returned by
    /// `next_pos`, via backward-shift deletion (no tombstones).
    pub fn remove_prev_pos(&mut self) {
        let slot = self
            .cursor
            .as_ref()
            .and_then(|c| c.last_slot)
            .expect("remove_prev_pos without a prior next_pos hit");

        let removed_pos = unsafe { self.pos_at(slot) }.as_usize();
        self.presence_set(removed_pos, false);

        let n = self.num_slots;
        let mut i = slot;
        unsafe { self.clear_slot(i) };
        loop {
            let mut j = i;
            let mut found = None;
            loop {
                j = (j + 1) % n;
                let pj = unsafe { self.pos_at(j) };
                if pj == W::EMPTY {
                    break;
                }
                let k = unsafe { self.fp_at(j) }.as_usize() % n;
                if !in_cyclic_range(i, k, j) {
                    found = Some(j);
                    break;
                }
            }
            match found {
                None => break,
                Some(j) => {
                    let fp = unsafe { self.fp_at(j) };
                    let pos = unsafe { self.pos_at(j) };
                    unsafe {
                        self.set_slot(i, fp, pos);
                        self.clear_slot(j);
                    }
                    i = j;
                }
            }
        }
    }

    /// Rebind the most-recently-returned pair to `new_pos` (used when a
    /// grown value is relocated to a new block run).
    pub fn replace_prev_pos(&mut self, new_pos: usize) {
        let cursor = self
            .cursor
            .as_ref()
            .expect("replace_prev_pos without start_search");
        let slot = cursor.last_slot.expect("replace_prev_pos without a prior next_pos hit");
        let old_pos = unsafe { self.pos_at(slot) }.as_usize();
        unsafe { W::write_at(self.positions, slot, W::from_usize(new_pos)) };
        self.presence_set(old_pos, false);
        self.presence_set(new_pos, true);
    }

    /// All occupied positions, ascending.
    pub fn positions(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for pos in 0..self.num_slots {
            if self.presence_get(pos) {
                out.push(pos);
            }
        }
        out
    }

    /// Visit every `(fingerprint, position)` pair currently stored.
    pub fn for_each(&self, mut consumer: impl FnMut(u64, usize)) {
        for slot in 0..self.num_slots {
            let pos = unsafe { self.pos_at(slot) };
            if pos != W::EMPTY {
                let fp = unsafe { self.fp_at(slot) };
                consumer(fp.as_usize() as u64, pos.as_usize());
            }
        }
    }

    pub fn clear_all(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.positions, 0xFF, self.num_slots * W::SIZE);
            std::ptr::write_bytes(self.presence, 0, self.num_slots.div_ceil(8));
        }
        self.cursor = None;
    }
}

/// True if `k` lies in the cyclic half-open-then-closed interval `(i, j]`.
fn in_cyclic_range(i: usize, k: usize, j: usize) -> bool {
    if i <= j {
        k > i && k <= j
    } else {
        k > i || k <= j
    }
}
