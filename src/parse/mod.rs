//! nom parsers for the HDF5 on-disk metadata structures.
//!
//! Every parser takes a slice of the mapped file beginning at the structure
//! it decodes and returns `(rest, value)`. Addresses inside parsed
//! structures are file-relative; the caller re-slices the mapped file to
//! follow them.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::number::streaming::{le_u16, le_u32, le_u8};

pub mod btree;
pub mod datatype;
pub mod dataspace;
pub mod heap;
pub mod layout;
pub mod link;
pub mod object;

pub type Result<'a, O> =
    std::result::Result<(&'a [u8], O), nom::Err<nom::error::VerboseError<&'a [u8]>>>;

/// The 8-byte format signature.
pub const SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n'];

/// Candidate signature positions, in search order. The first hit wins.
pub const SIGNATURE_OFFSETS: [u64; 4] = [0, 512, 1024, 2048];

/// Size-of-offsets and size-of-lengths, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct Sizes {
    pub offset: u8,
    pub length: u8,
}

/// Abort a parse with a labeled failure.
pub(crate) fn fail<'a, O>(input: &'a [u8], label: &'static str) -> Result<'a, O> {
    Err(nom::Err::Failure(nom::error::VerboseError {
        errors: vec![(input, nom::error::VerboseErrorKind::Context(label))],
    }))
}

/// Read `len` bytes as an unsigned little-endian integer, normalizing the
/// all-ones undefined sentinel of any width to `u64::MAX`.
pub fn address<'a>(len: u8) -> impl Fn(&'a [u8]) -> Result<'a, u64> {
    move |input| {
        let (input, bytes) = take(len)(input)?;
        Ok((input, crate::reader::fold_le(bytes)))
    }
}

/// Align a message-relative size up to the 8-byte message boundary.
pub fn pad8<T>(t: T) -> usize
where
    usize: From<T>,
{
    let t = usize::from(t);
    if t % 8 == 0 {
        t
    } else {
        t + (8 - (t % 8))
    }
}

/// Locate the signature among the candidate offsets.
///
/// Returns the byte distance from the start of the file to the first HDF5
/// byte. A MAT-file v7.3 puts its subsystem header first, so the signature
/// lands at 512.
pub fn find_signature(contents: &[u8]) -> Option<u64> {
    SIGNATURE_OFFSETS.iter().copied().find(|&pos| {
        contents
            .get(pos as usize..pos as usize + 8)
            .map_or(false, |w| w == SIGNATURE)
    })
}

/// Where the root group lives, by superblock generation.
#[derive(Debug, Clone)]
pub enum RootLocation {
    /// Versions 0 and 1 embed the root group's symbol-table entry.
    SymbolTableEntry(SymbolTableEntry),
    /// Versions 2 and 3 store the root group object header address.
    ObjectHeader(u64),
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_node_k: u16,
    pub group_internal_node_k: u16,
    pub base_address: u64,
    pub end_of_file_address: u64,
    pub root: RootLocation,
}

impl Superblock {
    pub fn sizes(&self) -> Sizes {
        Sizes {
            offset: self.offset_size,
            length: self.length_size,
        }
    }

    /// Object header address of the root group, or the v0/v1 entry's one.
    pub fn root_header_address(&self) -> u64 {
        match &self.root {
            RootLocation::SymbolTableEntry(entry) => entry.object_header_address,
            RootLocation::ObjectHeader(addr) => *addr,
        }
    }
}

/// Parse a superblock of any supported version. `input` starts at the
/// signature.
pub fn superblock(input: &[u8]) -> Result<Superblock> {
    context("superblock", |input| {
        let (input, _) = tag(&SIGNATURE[..])(input)?;
        let (_, version) = le_u8(input)?;
        match version {
            0 | 1 => superblock_v0(input),
            2 | 3 => superblock_v2(input),
            _ => fail(input, "superblock version"),
        }
    })(input)
}

fn superblock_v0(input: &[u8]) -> Result<Superblock> {
    context("superblock v0/v1", |input| {
        let (input, version) = le_u8(input)?;
        let (input, _free_space_storage_version) = le_u8(input)?;
        let (input, _root_group_symbol_table_entry_version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, _shared_header_message_format_version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, group_leaf_node_k) = le_u16(input)?;
        let (input, group_internal_node_k) = le_u16(input)?;
        let (input, _file_consistency_flags) = le_u32(input)?;
        // Version 1 squeezes in the indexed-storage K plus padding.
        let (input, _) = if version == 1 {
            take(4usize)(input)?
        } else {
            (input, &input[..0])
        };
        let (input, base_address) = address(offset_size)(input)?;
        let (input, _address_of_file_free_space_info) = address(offset_size)(input)?;
        let (input, end_of_file_address) = address(offset_size)(input)?;
        let (input, _driver_information_block_address) = address(offset_size)(input)?;
        let (input, root_entry) = symbol_table_entry(input, offset_size)?;

        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                group_leaf_node_k,
                group_internal_node_k,
                base_address,
                end_of_file_address,
                root: RootLocation::SymbolTableEntry(root_entry),
            },
        ))
    })(input)
}

fn superblock_v2(input: &[u8]) -> Result<Superblock> {
    context("superblock v2/v3", |input| {
        let (input, version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, _file_consistency_flags) = le_u8(input)?;
        let (input, base_address) = address(offset_size)(input)?;
        let (input, _superblock_extension_address) = address(offset_size)(input)?;
        let (input, end_of_file_address) = address(offset_size)(input)?;
        let (input, root_header_address) = address(offset_size)(input)?;
        let (input, _checksum) = le_u32(input)?;

        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                group_leaf_node_k: 0,
                group_internal_node_k: 0,
                base_address,
                end_of_file_address,
                root: RootLocation::ObjectHeader(root_header_address),
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    /// Scratch interpretation for cache type 1: cached group B-tree address.
    pub btree_address: u64,
    /// Scratch interpretation for cache type 1: cached group name heap address.
    pub heap_address: u64,
    /// Scratch interpretation for cache type 2: heap offset of a soft-link target.
    pub link_value_offset: u32,
}

pub fn symbol_table_entry(input: &[u8], offset_size: u8) -> Result<SymbolTableEntry> {
    context("symbol table entry", |input| {
        let (input, link_name_offset) = address(offset_size)(input)?;
        let (input, object_header_address) = address(offset_size)(input)?;
        let (input, cache_type) = le_u32(input)?;
        let (input, _) = tag([0, 0, 0, 0])(input)?;
        let (input, scratch) = take(16usize)(input)?;

        let (_, btree_address) = address(offset_size)(scratch)?;
        let (_, heap_address) = address(offset_size)(&scratch[offset_size as usize..])?;
        let (_, link_value_offset) = le_u32(scratch)?;

        Ok((
            input,
            SymbolTableEntry {
                link_name_offset,
                object_header_address,
                cache_type,
                btree_address,
                heap_address,
                link_value_offset,
            },
        ))
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v0_superblock_bytes() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&SIGNATURE);
        b.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
        b.extend_from_slice(&4u16.to_le_bytes());
        b.extend_from_slice(&16u16.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes()); // base
        b.extend_from_slice(&u64::MAX.to_le_bytes()); // free space
        b.extend_from_slice(&4096u64.to_le_bytes()); // eof
        b.extend_from_slice(&u64::MAX.to_le_bytes()); // driver info
        b.extend_from_slice(&0u64.to_le_bytes()); // root: link name offset
        b.extend_from_slice(&96u64.to_le_bytes()); // root: header address
        b.extend_from_slice(&1u32.to_le_bytes()); // root: cache type
        b.extend_from_slice(&[0; 4]);
        b.extend_from_slice(&136u64.to_le_bytes()); // scratch: btree
        b.extend_from_slice(&680u64.to_le_bytes()); // scratch: heap
        b
    }

    #[test]
    fn parses_v0_superblock() {
        let bytes = v0_superblock_bytes();
        let (_, sb) = superblock(&bytes).unwrap();
        assert_eq!(sb.version, 0);
        assert_eq!(sb.offset_size, 8);
        assert_eq!(sb.length_size, 8);
        assert_eq!(sb.end_of_file_address, 4096);
        assert_eq!(sb.root_header_address(), 96);
        match sb.root {
            RootLocation::SymbolTableEntry(entry) => {
                assert_eq!(entry.cache_type, 1);
                assert_eq!(entry.btree_address, 136);
                assert_eq!(entry.heap_address, 680);
            }
            RootLocation::ObjectHeader(_) => panic!("v0 root must be a symbol table entry"),
        }
    }

    #[test]
    fn parses_v2_superblock() {
        let mut b = Vec::new();
        b.extend_from_slice(&SIGNATURE);
        b.push(2); // version
        b.push(8); // offset size
        b.push(8); // length size
        b.push(0); // flags
        b.extend_from_slice(&0u64.to_le_bytes()); // base
        b.extend_from_slice(&u64::MAX.to_le_bytes()); // extension
        b.extend_from_slice(&2048u64.to_le_bytes()); // eof
        b.extend_from_slice(&48u64.to_le_bytes()); // root header
        b.extend_from_slice(&0u32.to_le_bytes()); // checksum
        let (_, sb) = superblock(&b).unwrap();
        assert_eq!(sb.version, 2);
        assert_eq!(sb.root_header_address(), 48);
    }

    #[test]
    fn rejects_future_superblock_version() {
        let mut bytes = v0_superblock_bytes();
        bytes[8] = 4;
        assert!(superblock(&bytes).is_err());
    }

    #[test]
    fn signature_found_at_mat_offset() {
        let mut padded = vec![0u8; 512];
        padded.extend_from_slice(&v0_superblock_bytes());
        assert_eq!(find_signature(&padded), Some(512));
    }

    #[test]
    fn smallest_offset_wins_when_signature_repeats() {
        let mut contents = vec![0u8; 2056];
        contents[512..520].copy_from_slice(&SIGNATURE);
        contents[2048..2056].copy_from_slice(&SIGNATURE);
        assert_eq!(find_signature(&contents), Some(512));
    }

    #[test]
    fn no_signature_anywhere() {
        assert_eq!(find_signature(&[0u8; 4096]), None);
    }
}
