//! The process-shared spin-lock embedded at segment header offset 0.
//!
//! The lock word must live at a fixed offset in the mapped segment so
//! every process mapping the same file sees the same bits — it cannot be
//! a `std::sync::Mutex` (those aren't valid across processes). Implemented
//! as a compare-and-swap on an 8-byte word encoding the holder's OS thread
//! id, mirroring the raw-pointer-over-mmap style the teacher codebase uses
//! for its own disk-backed table (`hashindex::mmap_table::MmapTable`).

use crate::error::{MapError, MapResult};
use crate::listener::ErrorSink;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct SegmentLock {
    word: *mut AtomicU64,
}

unsafe impl Send for SegmentLock {}
unsafe impl Sync for SegmentLock {}

impl SegmentLock {
    /// `ptr` must point to 8 bytes, 8-byte aligned, reserved for this lock.
    pub unsafe fn new(ptr: *mut u8) -> Self {
        Self {
            word: ptr as *mut AtomicU64,
        }
    }

    #[inline(always)]
    fn word(&self) -> &AtomicU64 {
        unsafe { &*self.word }
    }

    /// Acquire the lock, spinning (then yielding) up to `timeout`. On
    /// timeout, notifies `sink` and forcibly resets the word (the holder
    /// is presumed dead) before retrying.
    pub fn acquire(
        &self,
        timeout: Duration,
        interrupted: &AtomicBool,
        sink: &dyn ErrorSink,
    ) -> MapResult<()> {
        let tid = current_thread_id();
        let mut waited_since = Instant::now();
        let mut spins: u32 = 0;

        loop {
            if self
                .word()
                .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            if interrupted.swap(false, Ordering::Relaxed) {
                return Err(MapError::Interrupted);
            }

            if waited_since.elapsed() >= timeout {
                let holder = self.word().load(Ordering::Relaxed);
                sink.on_lock_timeout(holder);
                tracing::warn!(holder_tid = holder, "segment lock timed out, forcing reset");
                self.word().store(0, Ordering::Release);
                waited_since = Instant::now();
                continue;
            }

            spins += 1;
            if spins < 200 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn release(&self) {
        self.word().store(0, Ordering::Release);
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    let v = h.finish();
    if v == 0 { 1 } else { v }
}
