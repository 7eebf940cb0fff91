//! Collaborator interfaces that observe or seed mutations, plus no-op
//! defaults so a caller who doesn't need them isn't forced to implement
//! them.

/// Notified around puts, gets, removes and relocations. All methods have
/// no-op defaults.
pub trait EventListener<K, V> {
    fn on_put(&self, _added: bool, _key: &K, _value: &V, _pos: usize) {}
    fn on_get(&self, _key: &K, _value: &V) {}
    fn on_remove(&self, _key: &K, _value: &V, _pos: usize) {}
    fn on_relocation(&self, _old_pos: usize) {}
}

pub struct NoopListener;
impl<K, V> EventListener<K, V> for NoopListener {}

/// Notified of recoverable lock-timeout events and unlock failures.
pub trait ErrorSink: Send + Sync {
    fn on_lock_timeout(&self, holder_tid: u64);
    fn on_unlock_error(&self, error: &crate::error::MapError);
}

/// Logs via `tracing` and otherwise takes no action — the default sink.
pub struct AbortErrorSink;

impl ErrorSink for AbortErrorSink {
    fn on_lock_timeout(&self, holder_tid: u64) {
        tracing::error!(holder_tid, "segment lock timed out");
    }
    fn on_unlock_error(&self, error: &crate::error::MapError) {
        tracing::error!(%error, "error releasing segment lock");
    }
}

/// Supplies a value for `acquire(create = false)` on a missing key.
pub trait DefaultValueProvider<K, V> {
    fn get(&self, key: &K) -> Option<V>;
}

impl<K, V> DefaultValueProvider<K, V> for () {
    fn get(&self, _key: &K) -> Option<V> {
        None
    }
}

/// Builds a fresh value for `acquire(create = true)` when no `using_value`
/// is supplied.
pub trait ValueFactory<V> {
    fn create(&self) -> V;
}

impl<V: Default> ValueFactory<V> for () {
    fn create(&self) -> V {
        V::default()
    }
}

/// A `ValueFactory` that is never actually invoked. Used at call sites
/// where `create` is statically known to be `false`, so the bound is
/// satisfiable without requiring `V: Default`.
pub struct NoFactory;

impl<V> ValueFactory<V> for NoFactory {
    fn create(&self) -> V {
        unreachable!("NoFactory::create invoked with create = false")
    }
}

/// Optional capability: a value type that can rebind its backing storage
/// directly to live entry bytes, so
/// subsequent reads observe the map's bytes without a fresh copy. Not
/// required by `acquire` — only types that implement it get the binding;
/// every other value type always gets a freshly decoded copy.
pub trait Byteable {
    /// `ptr`/`len` describe the entry's value bytes within the mapping.
    /// `self` must not outlive the segment lock under which it was bound.
    unsafe fn bind(&mut self, ptr: *mut u8, len: usize);
}
