//! Shared helpers for the integration tests: temporary files and
//! hand-assembled HDF5 images for shapes the crate's writer does not
//! produce (chunked storage, filter pipelines, soft links).

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A unique temporary file path; the file is removed when dropped.
pub struct TempFile(pub PathBuf);

impl TempFile {
    pub fn new(tag: &str) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("h5lite-test-{}-{}-{}.h5", std::process::id(), tag, n));
        TempFile(path)
    }

    pub fn write(tag: &str, bytes: &[u8]) -> Self {
        let file = TempFile::new(tag);
        std::fs::write(&file.0, bytes).expect("writing test image");
        file
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub fn le_i32s(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn le_f64s(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(6));
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Byte shuffle as the shuffle filter performs it on write.
pub fn shuffle(data: &[u8], width: usize) -> Vec<u8> {
    let count = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for (k, element) in data.chunks_exact(width).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            out[j * count + k] = *byte;
        }
    }
    out
}

const UNDEFINED: u64 = u64::MAX;

fn pad8(n: usize) -> usize {
    (n + 7) / 8 * 8
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// A version-1 header message block: header plus padded body.
fn v1_message(message_type: u16, body: &[u8]) -> Vec<u8> {
    let padded = pad8(body.len());
    let mut out = Vec::with_capacity(8 + padded);
    put_u16(&mut out, message_type);
    put_u16(&mut out, padded as u16);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(body);
    out.resize(8 + padded, 0);
    out
}

/// A version-1 object header from a list of (type, body) messages.
fn v1_object_header(messages: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let blocks: Vec<Vec<u8>> = messages
        .iter()
        .map(|(t, body)| v1_message(*t, body))
        .collect();
    let total: usize = blocks.iter().map(|b| b.len()).sum();
    let mut out = vec![1u8, 0];
    put_u16(&mut out, messages.len() as u16);
    put_u32(&mut out, 1);
    put_u32(&mut out, total as u32);
    out.extend_from_slice(&[0u8; 4]);
    for block in blocks {
        out.extend_from_slice(&block);
    }
    out
}

/// Version-0 superblock whose root entry points at object header address
/// 96 (immediately after the superblock).
fn superblock_v0(end_of_file: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(&[0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n']);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
    put_u16(&mut out, 4);
    put_u16(&mut out, 16);
    put_u32(&mut out, 0);
    put_u64(&mut out, 0);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, end_of_file);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, 0); // root link name offset
    put_u64(&mut out, 96); // root object header
    put_u32(&mut out, 0); // cache type: none
    put_u32(&mut out, 0);
    out.extend_from_slice(&[0u8; 16]);
    out
}

fn symbol_table_body(btree: u64, heap: u64) -> Vec<u8> {
    let mut body = Vec::new();
    put_u64(&mut body, btree);
    put_u64(&mut body, heap);
    body
}

fn group_btree(snod: u64, greatest_name_offset: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TREE");
    out.push(0);
    out.push(0);
    put_u16(&mut out, 1);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, 0);
    put_u64(&mut out, snod);
    put_u64(&mut out, greatest_name_offset);
    out
}

fn heap(segment_addr: u64, segment: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"HEAP");
    out.extend_from_slice(&[0, 0, 0, 0]);
    put_u64(&mut out, segment.len() as u64);
    put_u64(&mut out, 1);
    put_u64(&mut out, segment_addr);
    out.extend_from_slice(segment);
    out
}

/// One SNOD entry: (name heap offset, object header address, cache type,
/// scratch).
fn snod(entries: &[(u64, u64, u32, [u8; 16])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"SNOD");
    out.push(1);
    out.push(0);
    put_u16(&mut out, entries.len() as u16);
    for (name_offset, header, cache_type, scratch) in entries {
        put_u64(&mut out, *name_offset);
        put_u64(&mut out, *header);
        put_u32(&mut out, *cache_type);
        put_u32(&mut out, 0);
        out.extend_from_slice(scratch);
    }
    out
}

fn dataspace_1d(n: u64) -> Vec<u8> {
    let mut body = vec![1u8, 1, 0, 0, 0, 0, 0, 0];
    put_u64(&mut body, n);
    body
}

fn i32_datatype() -> Vec<u8> {
    let mut body = vec![0x10, 0x08, 0, 0];
    put_u32(&mut body, 4);
    put_u16(&mut body, 0);
    put_u16(&mut body, 32);
    body
}

/// Filter pipeline message, version 1, built-in filters without names.
pub fn pipeline_v1(filters: &[(u16, &[u32])]) -> Vec<u8> {
    let mut body = vec![1u8, filters.len() as u8, 0, 0, 0, 0, 0, 0];
    for (id, client) in filters {
        put_u16(&mut body, *id);
        put_u16(&mut body, 0); // no name
        put_u16(&mut body, 0); // flags
        put_u16(&mut body, client.len() as u16);
        for word in client.iter() {
            put_u32(&mut body, *word);
        }
        if client.len() % 2 == 1 {
            put_u32(&mut body, 0);
        }
    }
    body
}

/// Assemble a complete file holding one chunked int32 dataset `/y` of
/// shape `[n]` with `chunk_len`-element chunks.
///
/// `chunks` carries (origin, stored bytes) pairs, already run through
/// whatever pipeline `pipeline_body` describes.
pub fn chunked_i32_image(
    n: u64,
    chunk_len: u64,
    pipeline_body: Option<Vec<u8>>,
    chunks: &[(u64, Vec<u8>)],
) -> Vec<u8> {
    // Section sizes, computed before emission.
    let root_header = v1_object_header(&[(0x11, symbol_table_body(0, 0))]);
    let btree_addr = 96 + root_header.len() as u64;
    let heap_addr = btree_addr + 48;
    let segment_addr = heap_addr + 32;
    let mut segment = vec![0u8; 8];
    segment.extend_from_slice(b"y\0");
    segment.resize(16, 0);
    let snod_addr = segment_addr + segment.len() as u64;
    let dataset_addr = snod_addr + 48;

    // Dataset header messages; the chunk B-tree lands right after it.
    let mut layout_body = vec![3u8, 2, 2];
    put_u64(&mut layout_body, 0); // patched below
    put_u32(&mut layout_body, chunk_len as u32);
    put_u32(&mut layout_body, 4); // element size slot

    let mut messages = vec![
        (0x1, dataspace_1d(n)),
        (0x3, i32_datatype()),
        (0x8, layout_body),
    ];
    if let Some(body) = pipeline_body {
        messages.push((0xB, body));
    }
    let dataset_header_len = v1_object_header(&messages).len() as u64;
    let chunk_btree_addr = dataset_addr + dataset_header_len;

    // Patch the B-tree address into the layout message.
    messages[2].1[3..11].copy_from_slice(&chunk_btree_addr.to_le_bytes());
    let dataset_header = v1_object_header(&messages);

    // Chunk B-tree: header, entries, one trailing key.
    let entry_len = (4 + 4 + 16 + 8) as u64;
    let btree_len = 24 + entry_len * chunks.len() as u64 + 24;
    let mut chunk_data_addr = chunk_btree_addr + btree_len;
    let mut chunk_addrs = Vec::new();
    for (_, stored) in chunks {
        chunk_addrs.push(chunk_data_addr);
        chunk_data_addr += stored.len() as u64;
    }
    let end_of_file = chunk_data_addr;

    // Emission.
    let mut out = superblock_v0(end_of_file);
    out.extend_from_slice(&v1_object_header(&[(
        0x11,
        symbol_table_body(btree_addr, heap_addr),
    )]));
    assert_eq!(out.len() as u64, btree_addr);
    out.extend_from_slice(&group_btree(snod_addr, 8));
    assert_eq!(out.len() as u64, heap_addr);
    out.extend_from_slice(&heap(segment_addr, &segment));
    assert_eq!(out.len() as u64, snod_addr);
    out.extend_from_slice(&snod(&[(8, dataset_addr, 0, [0u8; 16])]));
    assert_eq!(out.len() as u64, dataset_addr);
    out.extend_from_slice(&dataset_header);
    assert_eq!(out.len() as u64, chunk_btree_addr);

    out.extend_from_slice(b"TREE");
    out.push(1);
    out.push(0);
    put_u16(&mut out, chunks.len() as u16);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, UNDEFINED);
    for ((origin, stored), addr) in chunks.iter().zip(&chunk_addrs) {
        put_u32(&mut out, stored.len() as u32);
        put_u32(&mut out, 0); // filter mask
        put_u64(&mut out, *origin);
        put_u64(&mut out, 0);
        put_u64(&mut out, *addr);
    }
    // Trailing key, one past the last chunk.
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);
    put_u64(&mut out, n);
    put_u64(&mut out, 0);
    assert_eq!(out.len() as u64, chunk_btree_addr + btree_len);

    for (_, stored) in chunks {
        out.extend_from_slice(stored);
    }
    assert_eq!(out.len() as u64, end_of_file);
    out
}

/// A file whose group `/g` holds the soft link `self -> /g/self`.
pub fn soft_link_cycle_image() -> Vec<u8> {
    let root_header = v1_object_header(&[(0x11, symbol_table_body(0, 0))]);
    let root_btree_addr = 96 + root_header.len() as u64;
    let heap_addr = root_btree_addr + 48;
    let segment_addr = heap_addr + 32;
    // Shared heap segment: "", "g", "self", "/g/self".
    let mut segment = vec![0u8; 8];
    segment.extend_from_slice(b"g\0");
    segment.resize(16, 0);
    segment.extend_from_slice(b"self\0");
    segment.resize(24, 0);
    segment.extend_from_slice(b"/g/self\0");
    segment.resize(32, 0);
    let root_snod_addr = segment_addr + segment.len() as u64;
    let g_header_addr = root_snod_addr + 48;
    let g_header = v1_object_header(&[(0x11, symbol_table_body(0, 0))]);
    let g_btree_addr = g_header_addr + g_header.len() as u64;
    let g_snod_addr = g_btree_addr + 48;
    let end_of_file = g_snod_addr + 48;

    let mut out = superblock_v0(end_of_file);
    out.extend_from_slice(&v1_object_header(&[(
        0x11,
        symbol_table_body(root_btree_addr, heap_addr),
    )]));
    assert_eq!(out.len() as u64, root_btree_addr);
    out.extend_from_slice(&group_btree(root_snod_addr, 8));
    assert_eq!(out.len() as u64, heap_addr);
    out.extend_from_slice(&heap(segment_addr, &segment));
    assert_eq!(out.len() as u64, root_snod_addr);
    out.extend_from_slice(&snod(&[(8, g_header_addr, 0, [0u8; 16])]));
    assert_eq!(out.len() as u64, g_header_addr);
    out.extend_from_slice(&v1_object_header(&[(
        0x11,
        symbol_table_body(g_btree_addr, heap_addr),
    )]));
    assert_eq!(out.len() as u64, g_btree_addr);
    out.extend_from_slice(&group_btree(g_snod_addr, 16));
    assert_eq!(out.len() as u64, g_snod_addr);
    // The soft link: cache type 2, scratch holds the heap offset of the
    // target path.
    let mut scratch = [0u8; 16];
    scratch[..4].copy_from_slice(&24u32.to_le_bytes());
    out.extend_from_slice(&snod(&[(16, 0, 2, scratch)]));
    assert_eq!(out.len() as u64, end_of_file);
    out
}
