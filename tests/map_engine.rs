//! End-to-end scenarios and algebraic-law/boundary coverage for `MapEngine`.

use offheap_map::codec::Align1;
use offheap_map::{
    entry, BytesCodec, EngineParams, EventListener, KeyCodec, MapBuilder, MapEngine, MapError,
    NoopListener, ValueCodec,
};
use std::cell::{Cell, RefCell};
use std::time::Duration;

fn params(segments: u32, entries_per_segment: u32, entry_size: u32) -> EngineParams {
    EngineParams {
        segments,
        entries_per_segment,
        entry_size,
        meta_data_bytes: 0,
        lock_timeout: Duration::from_secs(2),
    }
}

type ByteMap = MapEngine<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1>;

fn create(dir: &std::path::Path, name: &str, p: EngineParams) -> ByteMap {
    MapBuilder::new()
        .segments(p.segments)
        .entries_per_segment(p.entries_per_segment)
        .entry_size(p.entry_size)
        .create(dir.join(name))
        .unwrap()
}

fn open(dir: &std::path::Path, name: &str, p: EngineParams) -> ByteMap {
    MapBuilder::new()
        .segments(p.segments)
        .entries_per_segment(p.entries_per_segment)
        .entry_size(p.entry_size)
        .open(dir.join(name))
        .unwrap()
}

fn v(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

#[test]
fn scenario_1_single_segment_basics() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "s1.map", params(1, 8, 64));

    assert_eq!(map.put(&v("a"), &v("1"), &NoopListener).unwrap(), None);
    assert_eq!(map.put(&v("b"), &v("2"), &NoopListener).unwrap(), None);
    assert_eq!(map.get(&v("a")).unwrap(), Some(v("1")));
    assert_eq!(map.long_size(), 2);
    assert_eq!(map.remove(&v("a")).unwrap(), Some(v("1")));
    assert_eq!(map.long_size(), 1);

    let mut it = map.entry_iterator();
    let mut seen = Vec::new();
    while let Some(pair) = it.next().unwrap() {
        seen.push(pair);
    }
    assert_eq!(seen, vec![(v("b"), v("2"))]);
}

/// `KeyCodec` whose `hash` always collides, so two distinct keys land in the
/// same `HashIndex` fingerprint bucket and exercise the multi-map walk.
struct CollidingCodec;

impl KeyCodec<Vec<u8>> for CollidingCodec {
    fn hash(_key: &Vec<u8>) -> u64 {
        7
    }
    fn encoded_size(key: &Vec<u8>) -> usize {
        key.len()
    }
    fn write(key: &Vec<u8>, buf: &mut [u8]) {
        buf[..key.len()].copy_from_slice(key);
    }
    fn read(buf: &[u8], size: usize) -> Vec<u8> {
        buf[..size].to_vec()
    }
}

impl ValueCodec<Vec<u8>> for CollidingCodec {
    fn encoded_size(value: &Vec<u8>) -> usize {
        value.len()
    }
    fn write(value: &Vec<u8>, buf: &mut [u8]) {
        buf[..value.len()].copy_from_slice(value);
    }
    fn read(buf: &[u8], size: usize) -> Vec<u8> {
        buf[..size].to_vec()
    }
}

#[test]
fn scenario_2_fingerprint_collision_multi_map() {
    let dir = tempfile::tempdir().unwrap();
    let mut map: MapEngine<Vec<u8>, Vec<u8>, CollidingCodec, CollidingCodec, Align1> =
        MapBuilder::new()
            .segments(1)
            .entries_per_segment(8)
            .entry_size(64)
            .create(dir.path().join("s2.map"))
            .unwrap();

    let k1 = v("k1");
    let k2 = v("k2");
    map.put(&k1, &v("v1"), &NoopListener).unwrap();
    map.put(&k2, &v("v2"), &NoopListener).unwrap();

    assert_eq!(map.get(&k1).unwrap(), Some(v("v1")));
    assert_eq!(map.get(&k2).unwrap(), Some(v("v2")));

    map.remove(&k1).unwrap();
    assert_eq!(map.get(&k1).unwrap(), None);
    assert_eq!(map.get(&k2).unwrap(), Some(v("v2")));
}

#[derive(Default)]
struct RelocationListener {
    relocated_from: Cell<Option<usize>>,
}

impl EventListener<Vec<u8>, Vec<u8>> for RelocationListener {
    fn on_relocation(&self, old_pos: usize) {
        self.relocated_from.set(Some(old_pos));
    }
}

#[test]
fn scenario_3_relocation_on_growth_past_neighbor() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "s3.map", params(1, 8, 16));

    map.put(&v("k"), &v("short"), &NoopListener).unwrap();
    // Occupies the block right after "k"'s single block, so growing "k"
    // cannot extend in place.
    map.put(&v("neighbor"), &v("x"), &NoopListener).unwrap();

    let listener = RelocationListener::default();
    let long_value = v("a_very_long_value_exceeding_one_block_of_sixteen_bytes");
    map.put(&v("k"), &long_value, &listener).unwrap();

    assert!(listener.relocated_from.get().is_some());
    assert_eq!(map.get(&v("k")).unwrap(), Some(long_value.clone()));
    map.check_consistency().unwrap();

    let mut it = map.entry_iterator();
    let mut count_k = 0;
    while let Some((key, value)) = it.next().unwrap() {
        if key == v("k") {
            count_k += 1;
            assert_eq!(value, long_value);
        }
    }
    assert_eq!(count_k, 1);
}

#[test]
fn scenario_4_conditional_replace_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "s4.map", params(1, 8, 64));

    map.put(&v("k"), &v("v"), &NoopListener).unwrap();
    assert!(!map.replace_if(&v("k"), &v("x"), &v("y")).unwrap());
    assert_eq!(map.get(&v("k")).unwrap(), Some(v("v")));
}

#[test]
fn scenario_5_concurrent_writers_distinct_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let p = params(16, 4096, 128);
    // Create the file up front so both threads open the same fully-sized mapping.
    create(dir.path(), "s5.map", p).close();

    let path = dir.path().join("s5.map");

    crossbeam_utils::thread::scope(|scope| {
        for prefix in ["threadA", "threadB"] {
            let path = &path;
            scope.spawn(move |_| {
                let mut map: ByteMap = MapBuilder::new()
                    .segments(16)
                    .entries_per_segment(4096)
                    .entry_size(128)
                    .open(path)
                    .unwrap();
                for i in 0..10_000u32 {
                    let key = format!("{prefix}-{i}").into_bytes();
                    let value = format!("v{prefix}-{i}").into_bytes();
                    map.put(&key, &value, &NoopListener).unwrap();
                }
            });
        }
    })
    .unwrap();

    let mut map = open(dir.path(), "s5.map", p);
    assert_eq!(map.long_size(), 20_000);
    for i in 0..10_000u32 {
        assert_eq!(
            map.get(&format!("threadA-{i}").into_bytes()).unwrap(),
            Some(format!("vthreadA-{i}").into_bytes())
        );
        assert_eq!(
            map.get(&format!("threadB-{i}").into_bytes()).unwrap(),
            Some(format!("vthreadB-{i}").into_bytes())
        );
    }
}

#[test]
fn scenario_6_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let p = params(4, 256, 64);

    {
        let mut map = create(dir.path(), "s6.map", p);
        for i in 0..100u32 {
            map.put(&format!("k{i}").into_bytes(), &format!("v{i}").into_bytes(), &NoopListener)
                .unwrap();
        }
        map.close();
    }

    let mut map = open(dir.path(), "s6.map", p);
    let seen = RefCell::new(std::collections::HashSet::new());
    let mut it = map.entry_iterator();
    let mut n = 0;
    while let Some((key, value)) = it.next().unwrap() {
        let key_str = String::from_utf8(key).unwrap();
        let idx: u32 = key_str[1..].parse().unwrap();
        assert_eq!(value, format!("v{idx}").into_bytes());
        seen.borrow_mut().insert(idx);
        n += 1;
    }
    assert_eq!(n, 100);
    assert_eq!(seen.borrow().len(), 100);
}

#[test]
fn algebraic_laws() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "laws.map", params(1, 16, 64));

    map.put(&v("k"), &v("v1"), &NoopListener).unwrap();
    map.put(&v("k"), &v("v2"), &NoopListener).unwrap();
    assert_eq!(map.get(&v("k")).unwrap(), Some(v("v2")));

    map.remove(&v("k")).unwrap();
    assert_eq!(map.get(&v("k")).unwrap(), None);

    map.put_if_absent(&v("j"), &v("first"), &NoopListener).unwrap();
    map.put_if_absent(&v("j"), &v("second"), &NoopListener).unwrap();
    assert_eq!(map.get(&v("j")).unwrap(), Some(v("first")));

    assert_eq!(map.replace(&v("missing"), &v("x")).unwrap(), None);

    map.put(&v("m"), &v("old"), &NoopListener).unwrap();
    assert!(!map.remove_if(&v("m"), &v("wrong")).unwrap());
    assert!(map.remove_if(&v("m"), &v("old")).unwrap());
    assert_eq!(map.get(&v("m")).unwrap(), None);
}

#[test]
fn iterator_yields_every_surviving_entry_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "iter.map", params(2, 64, 64));

    for i in 0..50u32 {
        map.put(&format!("key{i}").into_bytes(), &format!("val{i}").into_bytes(), &NoopListener)
            .unwrap();
    }
    map.remove(&v("key10")).unwrap();
    map.remove(&v("key20")).unwrap();

    let mut it = map.entry_iterator();
    let mut counts = std::collections::HashMap::new();
    while let Some((key, _)) = it.next().unwrap() {
        *counts.entry(key).or_insert(0u32) += 1;
    }
    assert_eq!(counts.len(), 48);
    assert!(counts.values().all(|&c| c == 1));
    assert!(!counts.contains_key(&v("key10")));
    assert!(!counts.contains_key(&v("key20")));
}

#[test]
fn boundary_single_two_and_max_oversize_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let entry_size: usize = 16;
    let max_oversize: usize = 64; // offheap_map::engine::MAX_OVERSIZE
    let mut map = create(dir.path(), "boundary.map", params(1, 256, entry_size as u32));

    let key = v("k");
    let find_value_for_blocks = |target_blocks: usize| -> Vec<u8> {
        for len in 0..4096usize {
            let candidate = vec![b'x'; len];
            let total = entry::sizeof_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1>(
                0, &key, &candidate,
            );
            if entry::blocks(total, entry_size) == target_blocks {
                return candidate;
            }
        }
        panic!("no value length reached {target_blocks} blocks");
    };

    let one_block = find_value_for_blocks(1);
    map.put(&key, &one_block, &NoopListener).unwrap();
    map.check_consistency().unwrap();
    map.remove(&key).unwrap();

    let two_block = find_value_for_blocks(2);
    map.put(&key, &two_block, &NoopListener).unwrap();
    map.check_consistency().unwrap();
    map.remove(&key).unwrap();

    let max_block = find_value_for_blocks(max_oversize);
    map.put(&key, &max_block, &NoopListener).unwrap();
    map.check_consistency().unwrap();
    assert_eq!(map.get(&key).unwrap(), Some(max_block));
}

#[test]
fn segment_full_once_every_block_is_taken() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "full.map", params(1, 8, 16));

    for i in 0..8u32 {
        map.put(&vec![i as u8], &v("x"), &NoopListener).unwrap();
    }

    let err = map.put(&v("one-more"), &v("x"), &NoopListener).unwrap_err();
    assert!(matches!(err, MapError::SegmentFull(_)));
}

#[test]
fn oversize_value_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = create(dir.path(), "oversize.map", params(1, 256, 16));

    let huge = vec![0u8; 16 * 100]; // exceeds max_oversize (64) blocks
    let err = map.put(&v("k"), &huge, &NoopListener).unwrap_err();
    assert!(matches!(err, MapError::ValueTooLarge(_)));
}

#[test]
fn reopen_rejects_mismatched_parameters() {
    let dir = tempfile::tempdir().unwrap();
    create(dir.path(), "mismatch.map", params(1, 16, 64)).close();

    let result: Result<ByteMap, _> = MapBuilder::new()
        .segments(1)
        .entries_per_segment(16)
        .entry_size(128) // different entry_size than at creation
        .open(dir.path().join("mismatch.map"));
    assert!(result.is_err());
}
