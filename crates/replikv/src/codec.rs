//! Byte layouts for everything the node stores.
//!
//! Keys carry a one-byte tag followed by big-endian length-prefixed parts so
//! that a prefix scan over one record never bleeds into a neighbouring record
//! whose key merely starts with the same bytes.

const TAG_STRING: u8 = b'K';
const TAG_HASH_FIELD: u8 = b'H';
const TAG_HASH_SIZE: u8 = b'S';
const TAG_ZSET_MEMBER: u8 = b'Z';
const TAG_ZSET_SCORE: u8 = b'z';
const TAG_INDEX_DEF: u8 = b'D';

/// Meta key holding the last applied `(term, index)`.
pub const META_APPLIED_KEY: &[u8] = b"applied";

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xff;
const TERMINATOR: u8 = 0x01;

pub fn encode_string_key(pk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + pk.len());
    out.push(TAG_STRING);
    out.extend_from_slice(pk);
    out
}

fn push_len_prefixed(out: &mut Vec<u8>, part: &[u8]) {
    out.extend_from_slice(&(part.len() as u32).to_be_bytes());
    out.extend_from_slice(part);
}

fn tagged_prefix(tag: u8, pk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + pk.len());
    out.push(tag);
    push_len_prefixed(&mut out, pk);
    out
}

pub fn hash_field_prefix(pk: &[u8]) -> Vec<u8> {
    tagged_prefix(TAG_HASH_FIELD, pk)
}

pub fn encode_hash_field_key(pk: &[u8], field: &[u8]) -> Vec<u8> {
    let mut out = hash_field_prefix(pk);
    out.extend_from_slice(field);
    out
}

pub fn decode_hash_field_key(key: &[u8]) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    anyhow::ensure!(key.first() == Some(&TAG_HASH_FIELD), "not a hash field key");
    let mut offset = 1usize;
    let pk = read_len_prefixed(key, &mut offset)?;
    Ok((pk, key[offset..].to_vec()))
}

pub fn encode_hash_size_key(pk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + pk.len());
    out.push(TAG_HASH_SIZE);
    out.extend_from_slice(pk);
    out
}

pub fn encode_zset_member_key(pk: &[u8], member: &[u8]) -> Vec<u8> {
    let mut out = tagged_prefix(TAG_ZSET_MEMBER, pk);
    out.extend_from_slice(member);
    out
}

pub fn zset_score_prefix(pk: &[u8]) -> Vec<u8> {
    tagged_prefix(TAG_ZSET_SCORE, pk)
}

pub fn encode_zset_score_key(pk: &[u8], score: u64, member: &[u8]) -> Vec<u8> {
    let mut out = zset_score_prefix(pk);
    out.extend_from_slice(&score.to_be_bytes());
    out.extend_from_slice(member);
    out
}

/// Returns `(score, member)` from a score key.
pub fn decode_zset_score_key(key: &[u8]) -> anyhow::Result<(u64, Vec<u8>)> {
    anyhow::ensure!(key.first() == Some(&TAG_ZSET_SCORE), "not a zset score key");
    let mut offset = 1usize;
    let _pk = read_len_prefixed(key, &mut offset)?;
    let score = read_u64(key, &mut offset)?;
    Ok((score, key[offset..].to_vec()))
}

pub fn index_def_prefix() -> Vec<u8> {
    vec![TAG_INDEX_DEF]
}

pub fn encode_index_def_key(table: &str, field: &str) -> Vec<u8> {
    let mut out = index_def_prefix();
    push_len_prefixed(&mut out, table.as_bytes());
    out.extend_from_slice(field.as_bytes());
    out
}

/// Prefix shared by every entry of one index.
pub fn index_prefix(table: &str, index_name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + table.len() + index_name.len());
    push_len_prefixed(&mut out, table.as_bytes());
    push_len_prefixed(&mut out, index_name.as_bytes());
    out
}

/// Index entry key: `index_prefix || encoded value || pk`.
pub fn encode_index_entry_key(table: &str, index_name: &str, encoded_value: &[u8], pk: &[u8]) -> Vec<u8> {
    let mut out = index_prefix(table, index_name);
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(pk);
    out
}

/// Index value layout used inside an entry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexValueLayout {
    /// Escaped, terminated bytes.
    Bytes,
    /// Eight sign-flipped big-endian bytes.
    Int64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntryKey {
    pub table: String,
    pub index_name: String,
    pub value: Vec<u8>,
    pub pk: Vec<u8>,
}

pub fn decode_index_entry_key(key: &[u8], layout: IndexValueLayout) -> anyhow::Result<IndexEntryKey> {
    let mut offset = 0usize;
    let table = String::from_utf8(read_len_prefixed(key, &mut offset)?)?;
    let index_name = String::from_utf8(read_len_prefixed(key, &mut offset)?)?;
    let value = match layout {
        IndexValueLayout::Bytes => decode_ordered_bytes(key, &mut offset)?,
        IndexValueLayout::Int64 => {
            anyhow::ensure!(offset + 8 <= key.len(), "short index int value");
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[offset..offset + 8]);
            offset += 8;
            decode_ordered_i64(buf).to_string().into_bytes()
        }
    };
    Ok(IndexEntryKey {
        table,
        index_name,
        value,
        pk: key[offset..].to_vec(),
    })
}

/// Sign-flipped big-endian layout so byte order equals numeric order.
pub fn encode_ordered_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub fn decode_ordered_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64
}

/// Escape 0x00 as 0x00 0xff and terminate with 0x00 0x01, which keeps byte
/// order and makes the value self-delimiting ahead of the primary key.
pub fn encode_ordered_bytes(value: &[u8], out: &mut Vec<u8>) {
    out.reserve(value.len() + 2);
    for &b in value {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED_ZERO);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

pub fn decode_ordered_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        anyhow::ensure!(*offset < data.len(), "unterminated ordered bytes");
        let b = data[*offset];
        *offset += 1;
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        anyhow::ensure!(*offset < data.len(), "dangling escape in ordered bytes");
        let next = data[*offset];
        *offset += 1;
        match next {
            ESCAPED_ZERO => out.push(ESCAPE),
            TERMINATOR => return Ok(out),
            other => anyhow::bail!("invalid escape byte {other:#x}"),
        }
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when the prefix is all 0xff.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xff {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

pub fn encode_position(term: u64, index: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&term.to_be_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out
}

pub fn decode_position(data: &[u8]) -> anyhow::Result<(u64, u64)> {
    let mut offset = 0usize;
    let term = read_u64(data, &mut offset)?;
    let index = read_u64(data, &mut offset)?;
    Ok((term, index))
}

fn read_len_prefixed(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short length-prefixed part");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
