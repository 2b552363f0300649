//! Version-1 B-trees: group-node indexing (SNOD pointers) and the chunk
//! index of chunked datasets.
//!
//! Node layout: signature "TREE", node type, node level, entries used, left
//! and right sibling addresses, then alternating keys and child pointers
//! with one extra trailing key. Chunk keys order chunks by the
//! lexicographic tuple of their logical coordinates.

use std::cmp::Ordering;
use std::collections::HashSet;

use nom::bytes::streaming::tag;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u64, le_u8};

use crate::error::{Hdf5Error, Result as CResult};
use crate::reader::{is_undefined, slice_from};

use super::{address, fail, Result, Sizes};

/// One child pointer of a group-index node: the key (heap offset of the
/// name separating subtrees) and the child address (a SNOD for leaves, a
/// deeper node otherwise).
#[derive(Debug, Clone)]
pub struct GroupChild {
    pub key_name_offset: u64,
    pub child_address: u64,
}

#[derive(Debug)]
pub struct GroupNode {
    pub level: u8,
    pub left_sibling: u64,
    pub right_sibling: u64,
    pub children: Vec<GroupChild>,
}

/// Key of a chunk-index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored (post-filter) byte count of the chunk.
    pub nbytes: u32,
    /// Bit i set: filter i of the pipeline was skipped for this chunk.
    pub filter_mask: u32,
    /// Chunk origin in logical coordinates, one slot per chunk dimension;
    /// the trailing slot is always zero.
    pub offsets: Vec<u64>,
}

impl ChunkKey {
    /// Lexicographic order over the coordinate tuple.
    pub fn cmp_coords(&self, other: &ChunkKey) -> Ordering {
        self.offsets.cmp(&other.offsets)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub key: ChunkKey,
    /// Address of the stored chunk (leaf) or of a deeper node (internal).
    pub address: u64,
}

#[derive(Debug)]
pub struct ChunkNode {
    pub level: u8,
    pub left_sibling: u64,
    pub right_sibling: u64,
    pub entries: Vec<ChunkEntry>,
}

/// Parse a group-index node (node type 0).
pub fn group_node(input: &[u8], sizes: Sizes) -> Result<GroupNode> {
    context("group B-tree node", move |input| {
        let (input, _) = tag(b"TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        if node_type != 0 {
            return fail(input, "group B-tree node type");
        }
        let (input, level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, left_sibling) = address(sizes.offset)(input)?;
        let (input, right_sibling) = address(sizes.offset)(input)?;
        let mut input = input;
        let mut children = Vec::with_capacity(entries_used as usize);
        for _ in 0..entries_used {
            let (rest, key_name_offset) = address(sizes.length)(input)?;
            let (rest, child_address) = address(sizes.offset)(rest)?;
            children.push(GroupChild {
                key_name_offset,
                child_address,
            });
            input = rest;
        }
        // The trailing key is only needed for ordered insertion; skip it.
        Ok((
            input,
            GroupNode {
                level,
                left_sibling,
                right_sibling,
                children,
            },
        ))
    })(input)
}

/// Parse a chunk-index node (node type 1). `ncoords` is the number of
/// stored coordinates per key: dataset rank + 1.
pub fn chunk_node(input: &[u8], sizes: Sizes, ncoords: usize) -> Result<ChunkNode> {
    context("chunk B-tree node", move |input| {
        let (input, _) = tag(b"TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        if node_type != 1 {
            return fail(input, "chunk B-tree node type");
        }
        let (input, level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, left_sibling) = address(sizes.offset)(input)?;
        let (input, right_sibling) = address(sizes.offset)(input)?;
        let mut entries = Vec::with_capacity(entries_used as usize);
        let mut input = input;
        for _ in 0..entries_used {
            let (rest, key) = chunk_key(input, ncoords)?;
            let (rest, child) = address(sizes.offset)(rest)?;
            entries.push(ChunkEntry {
                key,
                address: child,
            });
            input = rest;
        }
        Ok((
            input,
            ChunkNode {
                level,
                left_sibling,
                right_sibling,
                entries,
            },
        ))
    })(input)
}

fn chunk_key(input: &[u8], ncoords: usize) -> Result<ChunkKey> {
    context("chunk key", move |input| {
        let (input, nbytes) = le_u32(input)?;
        let (input, filter_mask) = le_u32(input)?;
        // Chunk coordinates are always stored eight bytes wide.
        let (input, offsets) = count(le_u64, ncoords)(input)?;
        Ok((
            input,
            ChunkKey {
                nbytes,
                filter_mask,
                offsets,
            },
        ))
    })(input)
}

/// Enumerate the SNOD addresses of a group index in key order: descend to
/// the leftmost leaf, then follow right-sibling links.
pub fn walk_group_leaves(hdf: &[u8], root: u64, sizes: Sizes) -> CResult<Vec<u64>> {
    let mut snods = Vec::new();
    if is_undefined(root) {
        return Ok(snods);
    }

    let mut leaf = leftmost_group_leaf(hdf, root, sizes)?;
    let mut seen = HashSet::new();
    loop {
        if !seen.insert(leaf) {
            return Err(Hdf5Error::Malformed("group B-tree sibling cycle".to_owned()));
        }
        let (_, node) = group_node(slice_from(hdf, leaf)?, sizes)?;
        if node.level != 0 {
            return Err(Hdf5Error::Malformed("group B-tree level".to_owned()));
        }
        snods.extend(node.children.iter().map(|c| c.child_address));
        if is_undefined(node.right_sibling) {
            break;
        }
        leaf = node.right_sibling;
    }
    Ok(snods)
}

fn leftmost_group_leaf(hdf: &[u8], root: u64, sizes: Sizes) -> CResult<u64> {
    let mut current = root;
    let mut expected_level = None;
    loop {
        let (_, node) = group_node(slice_from(hdf, current)?, sizes)?;
        if let Some(expected) = expected_level {
            if node.level != expected {
                return Err(Hdf5Error::Malformed("group B-tree level".to_owned()));
            }
        }
        if node.level == 0 {
            return Ok(current);
        }
        let first = node
            .children
            .first()
            .ok_or_else(|| Hdf5Error::Malformed("empty group B-tree node".to_owned()))?;
        expected_level = Some(node.level - 1);
        current = first.child_address;
    }
}

/// Enumerate every stored chunk in coordinate order.
pub fn walk_chunks(hdf: &[u8], root: u64, sizes: Sizes, ncoords: usize) -> CResult<Vec<ChunkEntry>> {
    let mut chunks = Vec::new();
    if is_undefined(root) {
        return Ok(chunks);
    }

    let mut leaf = leftmost_chunk_leaf(hdf, root, sizes, ncoords)?;
    let mut seen = HashSet::new();
    loop {
        if !seen.insert(leaf) {
            return Err(Hdf5Error::Malformed("chunk B-tree sibling cycle".to_owned()));
        }
        let (_, node) = chunk_node(slice_from(hdf, leaf)?, sizes, ncoords)?;
        if node.level != 0 {
            return Err(Hdf5Error::Malformed("chunk B-tree level".to_owned()));
        }
        for pair in node.entries.windows(2) {
            if pair[0].key.cmp_coords(&pair[1].key) != Ordering::Less {
                return Err(Hdf5Error::Malformed("chunk B-tree key order".to_owned()));
            }
        }
        chunks.extend(node.entries.iter().cloned());
        if is_undefined(node.right_sibling) {
            break;
        }
        leaf = node.right_sibling;
    }
    Ok(chunks)
}

fn leftmost_chunk_leaf(hdf: &[u8], root: u64, sizes: Sizes, ncoords: usize) -> CResult<u64> {
    let mut current = root;
    let mut expected_level = None;
    loop {
        let (_, node) = chunk_node(slice_from(hdf, current)?, sizes, ncoords)?;
        if let Some(expected) = expected_level {
            if node.level != expected {
                return Err(Hdf5Error::Malformed("chunk B-tree level".to_owned()));
            }
        }
        if node.level == 0 {
            return Ok(current);
        }
        let first = node
            .entries
            .first()
            .ok_or_else(|| Hdf5Error::Malformed("empty chunk B-tree node".to_owned()))?;
        expected_level = Some(node.level - 1);
        current = first.address;
    }
}
