//! Entry codec: variable-length size encoding, alignment, and key/value
//! read/write through the external codec interfaces. The engine never
//! interprets key/value bytes itself — only offsets computed here.

use crate::codec::{KeyCodec, SizeEncoder, ValueAlignment, ValueCodec, VarintSizeEncoder};

/// Byte offsets within one entry's block run.
#[derive(Debug, Clone, Copy)]
pub struct EntryLayout {
    pub key_size: usize,
    pub key_start: usize,
    pub value_start: usize,
    pub value_size: usize,
    /// Total bytes used by the entry, from offset 0.
    pub entry_end: usize,
}

impl EntryLayout {
    pub fn key_end(&self) -> usize {
        self.key_start + self.key_size
    }
}

/// The block-footprint of `n` bytes: `ceil(n / block_size)`.
pub fn blocks(bytes: usize, block_size: usize) -> usize {
    bytes.div_ceil(block_size)
}

fn layout_for_sizes<A: ValueAlignment>(
    meta_data_bytes: usize,
    key_size: usize,
    value_size: usize,
) -> EntryLayout {
    let key_size_enc = VarintSizeEncoder::encoding_size(key_size as u64);
    let key_start = meta_data_bytes + key_size_enc;
    let value_unaligned = key_start + key_size;
    let value_aligned = A::align(value_unaligned);
    let value_size_enc = VarintSizeEncoder::encoding_size(value_size as u64);
    let value_start = value_aligned + value_size_enc;
    EntryLayout {
        key_size,
        key_start,
        value_start,
        value_size,
        entry_end: value_start + value_size,
    }
}

/// Total bytes a `(key, value)` pair would occupy, for allocation sizing.
pub fn sizeof_entry<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, A: ValueAlignment>(
    meta_data_bytes: usize,
    key: &K,
    value: &V,
) -> usize {
    layout_for_sizes::<A>(meta_data_bytes, KC::encoded_size(key), VC::encoded_size(value)).entry_end
}

/// Write a brand-new entry (meta zeroed, key, value) into `buf`.
pub fn write_entry<K, V, KC: KeyCodec<K>, VC: ValueCodec<V>, A: ValueAlignment>(
    buf: &mut [u8],
    meta_data_bytes: usize,
    key: &K,
    value: &V,
) -> EntryLayout {
    let key_size = KC::encoded_size(key);
    let value_size = VC::encoded_size(value);
    let layout = layout_for_sizes::<A>(meta_data_bytes, key_size, value_size);

    buf[..meta_data_bytes].fill(0);
    VarintSizeEncoder::write(&mut buf[meta_data_bytes..], key_size as u64);
    KC::write(key, &mut buf[layout.key_start..layout.key_start + key_size]);

    let value_aligned = A::align(layout.key_start + key_size);
    VarintSizeEncoder::write(&mut buf[value_aligned..], value_size as u64);
    VC::write(value, &mut buf[layout.value_start..layout.value_start + value_size]);

    layout
}

/// Overwrite just the value portion of an existing entry, keeping the key
/// untouched.
pub fn overwrite_value<V, VC: ValueCodec<V>, A: ValueAlignment>(
    buf: &mut [u8],
    key_end: usize,
    value: &V,
) -> EntryLayout {
    let value_size = VC::encoded_size(value);
    let value_aligned = A::align(key_end);
    VarintSizeEncoder::write(&mut buf[value_aligned..], value_size as u64);
    let value_size_enc = VarintSizeEncoder::encoding_size(value_size as u64);
    let value_start = value_aligned + value_size_enc;
    VC::write(value, &mut buf[value_start..value_start + value_size]);
    EntryLayout {
        key_size: 0,
        key_start: 0,
        value_start,
        value_size,
        entry_end: value_start + value_size,
    }
}

/// The `entry_end` a replacement value of `value_size` bytes would produce,
/// given the entry's existing `key_end` — without writing anything. Used to
/// decide in-place/shrink/grow/relocate before touching the allocator.
pub fn entry_end_for_value<A: ValueAlignment>(key_end: usize, value_size: usize) -> usize {
    let value_aligned = A::align(key_end);
    let value_size_enc = VarintSizeEncoder::encoding_size(value_size as u64);
    value_aligned + value_size_enc + value_size
}

/// Parse an existing entry's byte layout.
pub fn read_layout<A: ValueAlignment>(buf: &[u8], meta_data_bytes: usize) -> EntryLayout {
    let (key_size, key_size_enc) = VarintSizeEncoder::read(&buf[meta_data_bytes..]);
    let key_size = key_size as usize;
    let key_start = meta_data_bytes + key_size_enc;
    let value_unaligned = key_start + key_size;
    let value_aligned = A::align(value_unaligned);
    let (value_size, value_size_enc) = VarintSizeEncoder::read(&buf[value_aligned..]);
    let value_size = value_size as usize;
    let value_start = value_aligned + value_size_enc;
    EntryLayout {
        key_size,
        key_start,
        value_start,
        value_size,
        entry_end: value_start + value_size,
    }
}

pub fn read_key<K, KC: KeyCodec<K>>(buf: &[u8], layout: &EntryLayout) -> K {
    KC::read(&buf[layout.key_start..layout.key_end()], layout.key_size)
}

pub fn read_value<V, VC: ValueCodec<V>>(buf: &[u8], layout: &EntryLayout) -> V {
    VC::read(
        &buf[layout.value_start..layout.value_start + layout.value_size],
        layout.value_size,
    )
}

pub fn key_matches<K, KC: KeyCodec<K>>(buf: &[u8], layout: &EntryLayout, key: &K) -> bool {
    KC::equal_prefix(&buf[layout.key_start..], key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Align1, Align8, BytesCodec};

    #[test]
    fn write_then_read_roundtrip() {
        let mut buf = vec![0u8; 256];
        let key = b"hello".to_vec();
        let value = b"world!!".to_vec();
        write_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1>(&mut buf, 0, &key, &value);

        let layout = read_layout::<Align1>(&buf, 0);
        assert!(key_matches::<Vec<u8>, BytesCodec>(&buf, &layout, &key));
        let read_back: Vec<u8> = read_value::<Vec<u8>, BytesCodec>(&buf, &layout);
        assert_eq!(read_back, value);
    }

    #[test]
    fn alignment_is_respected() {
        let mut buf = vec![0u8; 256];
        let key = b"k".to_vec();
        let value = b"v".to_vec();
        let layout =
            write_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align8>(&mut buf, 0, &key, &value);
        let value_write_start = layout.value_start - VarintSizeEncoder::encoding_size(1);
        assert_eq!(value_write_start % 8, 0);
    }

    #[test]
    fn overwrite_value_keeps_key() {
        let mut buf = vec![0u8; 256];
        let key = b"stable-key".to_vec();
        let layout = write_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1>(
            &mut buf,
            0,
            &key,
            &b"old".to_vec(),
        );
        overwrite_value::<Vec<u8>, BytesCodec, Align1>(&mut buf, layout.key_end(), &b"newvalue".to_vec());

        let layout2 = read_layout::<Align1>(&buf, 0);
        assert!(key_matches::<Vec<u8>, BytesCodec>(&buf, &layout2, &key));
        let v: Vec<u8> = read_value::<Vec<u8>, BytesCodec>(&buf, &layout2);
        assert_eq!(v, b"newvalue".to_vec());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn write_then_read_roundtrip_arbitrary(
            key in proptest::collection::vec(any::<u8>(), 0..64),
            value in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut buf = vec![0u8; 512];
            write_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align8>(&mut buf, 0, &key, &value);
            let layout = read_layout::<Align8>(&buf, 0);
            prop_assert!(key_matches::<Vec<u8>, BytesCodec>(&buf, &layout, &key));
            let read_back: Vec<u8> = read_value::<Vec<u8>, BytesCodec>(&buf, &layout);
            prop_assert_eq!(read_back, value);
        }

        #[test]
        fn overwrite_value_never_disturbs_key_bytes(
            key in proptest::collection::vec(any::<u8>(), 1..32),
            old_value in proptest::collection::vec(any::<u8>(), 0..32),
            new_value in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut buf = vec![0u8; 512];
            let layout = write_entry::<Vec<u8>, Vec<u8>, BytesCodec, BytesCodec, Align1>(&mut buf, 0, &key, &old_value);
            overwrite_value::<Vec<u8>, BytesCodec, Align1>(&mut buf, layout.key_end(), &new_value);

            let layout2 = read_layout::<Align1>(&buf, 0);
            prop_assert!(key_matches::<Vec<u8>, BytesCodec>(&buf, &layout2, &key));
            let v: Vec<u8> = read_value::<Vec<u8>, BytesCodec>(&buf, &layout2);
            prop_assert_eq!(v, new_value);
        }
    }
}
