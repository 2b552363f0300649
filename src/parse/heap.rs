//! Local heaps (group name storage), symbol-table nodes, and global heap
//! collections (variable-length data storage).

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u8};

use crate::error::{Hdf5Error, Result as CResult};
use crate::reader::slice_from;

use super::{address, symbol_table_entry, Result, Sizes, SymbolTableEntry};

#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub data_segment_size: u64,
    pub freelist_head_offset: u64,
    pub data_segment_address: u64,
}

pub fn local_heap(input: &[u8], sizes: Sizes) -> Result<LocalHeap> {
    context("local heap", move |input| {
        let (input, _) = tag(b"HEAP")(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _) = tag([0, 0, 0])(input)?;
        let (input, data_segment_size) = address(sizes.length)(input)?;
        let (input, freelist_head_offset) = address(sizes.length)(input)?;
        let (input, data_segment_address) = address(sizes.offset)(input)?;

        Ok((
            input,
            LocalHeap {
                data_segment_size,
                freelist_head_offset,
                data_segment_address,
            },
        ))
    })(input)
}

/// Read the null-terminated name stored at `offset` within a heap's data
/// segment.
pub fn heap_string(hdf: &[u8], heap: &LocalHeap, offset: u64) -> CResult<String> {
    if offset >= heap.data_segment_size {
        return Err(Hdf5Error::Malformed("heap string offset".to_owned()));
    }
    let segment = slice_from(hdf, heap.data_segment_address)?;
    let segment_len = heap.data_segment_size.min(segment.len() as u64) as usize;
    let bytes: Vec<u8> = segment[offset as usize..segment_len]
        .iter()
        .copied()
        .take_while(|b| *b != 0)
        .collect();
    String::from_utf8(bytes).map_err(|_| Hdf5Error::Malformed("heap string encoding".to_owned()))
}

#[derive(Debug)]
pub struct SymbolTableNode {
    pub entries: Vec<SymbolTableEntry>,
}

pub fn symbol_table_node(input: &[u8], sizes: Sizes) -> Result<SymbolTableNode> {
    context("symbol table node", move |input| {
        let (input, _) = tag(b"SNOD")(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, number_of_symbols) = le_u16(input)?;
        let (input, entries) = count(
            |i| symbol_table_entry(i, sizes.offset),
            number_of_symbols as usize,
        )(input)?;
        Ok((input, SymbolTableNode { entries }))
    })(input)
}

/// Fetch one object from a global heap collection. Variable-length data
/// elements reference their bytes with a (collection address, object
/// index) pair.
pub fn global_heap_object(
    hdf: &[u8],
    collection_address: u64,
    desired_index: u32,
    sizes: Sizes,
) -> CResult<Vec<u8>> {
    let input = slice_from(hdf, collection_address)?;
    let (_, data) = global_heap_nth(input, desired_index, sizes)?;
    Ok(data.to_vec())
}

fn global_heap_nth(input: &[u8], desired_index: u32, sizes: Sizes) -> Result<&[u8]> {
    context("global heap", move |input| {
        let (input, _) = tag(b"GCOL")(input)?;
        let (input, _) = tag([1])(input)?;
        let (input, _) = tag([0, 0, 0])(input)?;
        let (input, collection_size) = address(sizes.length)(input)?;

        // Object headers run until the free-space object (index 0) or the
        // end of the collection.
        let header_len = 8 + sizes.length as u64;
        let mut remaining_len = collection_size.saturating_sub(header_len);
        let mut input = input;
        loop {
            if remaining_len < 8 + sizes.length as u64 {
                return super::fail(input, "global heap object");
            }
            let (rest, heap_object_index) = le_u16(input)?;
            let (rest, _reference_count) = le_u16(rest)?;
            let (rest, _) = take(4usize)(rest)?;
            let (rest, object_size) = address(sizes.length)(rest)?;
            if heap_object_index == 0 {
                // Free space from here on; the object is absent.
                return super::fail(input, "global heap object");
            }
            let (rest, object_data) = take(object_size as usize)(rest)?;
            if u32::from(heap_object_index) == desired_index {
                return Ok((rest, object_data));
            }
            // Objects are padded out to eight-byte boundaries.
            let padded = pad8_u64(object_size);
            let (rest, _) = take((padded - object_size) as usize)(rest)?;
            remaining_len = remaining_len
                .saturating_sub(8 + sizes.length as u64)
                .saturating_sub(padded);
            input = rest;
        }
    })(input)
}

fn pad8_u64(n: u64) -> u64 {
    (n + 7) / 8 * 8
}
