//! Object headers: the per-object message sequence, in both the version-1
//! layout (unsigned prefix, 8-byte aligned messages) and the version-2
//! "OHDR" layout (signed blocks, optional creation order, checksums).
//!
//! Continuation messages are followed transparently; callers see one flat
//! message list in declaration order.

use std::collections::VecDeque;

use crate::error::{Hdf5Error, Result};
use crate::reader::{slice_at, slice_from, ByteReader, Endian};

use super::dataspace::{self, Dataspace};
use super::datatype::{self, Datatype};
use super::layout::{self, DataLayout, FilterPipeline};
use super::link::{self, Link, LinkInfo};
use super::{pad8, Sizes};

pub const MSG_NIL: u16 = 0x0;
pub const MSG_DATASPACE: u16 = 0x1;
pub const MSG_LINK_INFO: u16 = 0x2;
pub const MSG_DATATYPE: u16 = 0x3;
pub const MSG_FILL_VALUE_OLD: u16 = 0x4;
pub const MSG_FILL_VALUE: u16 = 0x5;
pub const MSG_LINK: u16 = 0x6;
pub const MSG_LAYOUT: u16 = 0x8;
pub const MSG_GROUP_INFO: u16 = 0xA;
pub const MSG_FILTER_PIPELINE: u16 = 0xB;
pub const MSG_ATTRIBUTE: u16 = 0xC;
pub const MSG_CONTINUATION: u16 = 0x10;
pub const MSG_SYMBOL_TABLE: u16 = 0x11;
pub const MSG_MODIFICATION_TIME: u16 = 0x12;
pub const MSG_ATTRIBUTE_INFO: u16 = 0x15;

#[derive(Debug, Clone)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub heap_address: u64,
}

/// Fill value from the new-style message (type 0x0005).
#[derive(Debug, Clone)]
pub struct FillValue {
    pub defined: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub fractal_heap_address: u64,
    pub name_btree_address: u64,
}

#[derive(Debug, Clone)]
pub enum Message {
    Nil,
    Dataspace(Dataspace),
    LinkInfo(LinkInfo),
    /// Raw body; resolved on demand by [`datatype::parse`] so that an
    /// exotic type on an object nobody reads cannot fail the whole header.
    Datatype(Vec<u8>),
    FillValueOld(Vec<u8>),
    FillValue(FillValue),
    Link(Link),
    Layout(DataLayout),
    GroupInfo,
    FilterPipeline(FilterPipeline),
    Attribute(AttributeMessage),
    Continuation { address: u64, length: u64 },
    SymbolTable(SymbolTableMessage),
    ModificationTime(u32),
    AttributeInfo(AttributeInfo),
    Unknown { type_code: u16 },
}

#[derive(Debug)]
pub struct ObjectHeader {
    pub version: u8,
    pub messages: Vec<Message>,
}

impl ObjectHeader {
    pub fn dataspace(&self) -> Option<&Dataspace> {
        self.messages.iter().find_map(|m| match m {
            Message::Dataspace(ds) => Some(ds),
            _ => None,
        })
    }

    pub fn datatype_raw(&self) -> Option<&[u8]> {
        self.messages.iter().find_map(|m| match m {
            Message::Datatype(raw) => Some(raw.as_slice()),
            _ => None,
        })
    }

    pub fn layout(&self) -> Option<&DataLayout> {
        self.messages.iter().find_map(|m| match m {
            Message::Layout(l) => Some(l),
            _ => None,
        })
    }

    pub fn filter_pipeline(&self) -> Option<&FilterPipeline> {
        self.messages.iter().find_map(|m| match m {
            Message::FilterPipeline(p) => Some(p),
            _ => None,
        })
    }

    pub fn fill_value(&self) -> Option<&FillValue> {
        self.messages.iter().find_map(|m| match m {
            Message::FillValue(f) => Some(f),
            _ => None,
        })
    }

    pub fn symbol_table(&self) -> Option<&SymbolTableMessage> {
        self.messages.iter().find_map(|m| match m {
            Message::SymbolTable(st) => Some(st),
            _ => None,
        })
    }

    pub fn link_info(&self) -> Option<&LinkInfo> {
        self.messages.iter().find_map(|m| match m {
            Message::LinkInfo(li) => Some(li),
            _ => None,
        })
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.messages.iter().filter_map(|m| match m {
            Message::Link(l) => Some(l),
            _ => None,
        })
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeMessage> {
        self.messages.iter().filter_map(|m| match m {
            Message::Attribute(a) => Some(a),
            _ => None,
        })
    }

    pub fn modification_time(&self) -> Option<u32> {
        self.messages.iter().find_map(|m| match m {
            Message::ModificationTime(t) => Some(*t),
            _ => None,
        })
    }

    /// The kind probe: an object with datatype, dataspace and layout is a
    /// dataset; anything else is treated as a group.
    pub fn is_dataset(&self) -> bool {
        self.datatype_raw().is_some() && self.dataspace().is_some() && self.layout().is_some()
    }
}

/// Parse the object header at a file-relative address, inlining all
/// continuation blocks.
pub fn object_header(hdf: &[u8], address: u64, sizes: Sizes) -> Result<ObjectHeader> {
    let start = slice_from(hdf, address)?;
    if start.get(..4) == Some(&b"OHDR"[..]) {
        object_header_v2(hdf, address, sizes)
    } else {
        object_header_v1(hdf, address, sizes)
    }
}

fn object_header_v1(hdf: &[u8], address: u64, sizes: Sizes) -> Result<ObjectHeader> {
    let block = slice_from(hdf, address)?;
    let mut r = ByteReader::new(block, sizes.offset, sizes.length);
    let version = r.read_u8()?;
    if version != 1 {
        return Err(Hdf5Error::UnsupportedVersion {
            what: "object header",
            version: u32::from(version),
        });
    }
    r.skip(1)?;
    let total_messages = r.read_u16(Endian::Little)?;
    let _reference_count = r.read_u32(Endian::Little)?;
    let header_size = r.read_u32(Endian::Little)?;
    // The prefix is padded out so messages start on an 8-byte boundary.
    r.skip(4)?;

    let mut blocks = VecDeque::new();
    blocks.push_back((address + 16, u64::from(header_size)));

    let mut messages = Vec::with_capacity(total_messages as usize);
    let mut current: Option<(ByteReader, u64)> = None;
    for _ in 0..total_messages {
        // A message header needs 8 bytes; move to the next block when the
        // current one is spent.
        while current.as_ref().map_or(true, |(r, _)| r.remaining() < 8) {
            match blocks.pop_front() {
                Some((addr, len)) => {
                    let slice = slice_at(hdf, addr, len)?;
                    current = Some((ByteReader::new(slice, sizes.offset, sizes.length), addr));
                }
                None => {
                    return Err(Hdf5Error::Malformed(
                        "object header message count".to_owned(),
                    ))
                }
            }
        }
        let (r, block_addr) = current.as_mut().unwrap();
        let message_address = *block_addr + r.cursor();
        let message_type = r.read_u16(Endian::Little)?;
        let size = r.read_u16(Endian::Little)?;
        let flags = r.read_u8()?;
        r.skip(3)?;
        let body = r.read_bytes(pad8(size))?;
        let body = &body[..size as usize];
        if crate::debug_enabled() {
            log::debug!(
                "header message type {:#06x} at {:#x}, {} bytes",
                message_type,
                message_address,
                size
            );
        }
        let message = parse_message(message_type, flags, body, sizes)?;
        if let Message::Continuation { address, length } = &message {
            blocks.push_back((*address, *length));
        }
        messages.push(message);
    }

    Ok(ObjectHeader { version, messages })
}

fn object_header_v2(hdf: &[u8], address: u64, sizes: Sizes) -> Result<ObjectHeader> {
    let block = slice_from(hdf, address)?;
    let mut r = ByteReader::new(block, sizes.offset, sizes.length);
    r.skip(4)?; // OHDR
    let version = r.read_u8()?;
    if version != 2 {
        return Err(Hdf5Error::UnsupportedVersion {
            what: "object header",
            version: u32::from(version),
        });
    }
    let flags = r.read_u8()?;
    if flags & 0x20 != 0 {
        // Access, modification, change and birth times.
        r.skip(16)?;
    }
    if flags & 0x10 != 0 {
        let _max_compact = r.read_u16(Endian::Little)?;
        let _min_dense = r.read_u16(Endian::Little)?;
    }
    let chunk0_size = match flags & 0x3 {
        0 => u64::from(r.read_u8()?),
        1 => u64::from(r.read_u16(Endian::Little)?),
        2 => u64::from(r.read_u32(Endian::Little)?),
        _ => r.read_u64(Endian::Little)?,
    };
    let tracked_order = flags & 0x4 != 0;
    let first_block_start = address + r.cursor();

    let mut blocks = VecDeque::new();
    blocks.push_back((first_block_start, chunk0_size));

    let mut messages = Vec::new();
    while let Some((block_addr, block_len)) = blocks.pop_front() {
        let slice = slice_at(hdf, block_addr, block_len)?;
        let mut r = ByteReader::new(slice, sizes.offset, sizes.length);
        let header_len = if tracked_order { 6 } else { 4 };
        while r.remaining() >= header_len {
            let message_address = block_addr + r.cursor();
            let message_type = u16::from(r.read_u8()?);
            let size = r.read_u16(Endian::Little)?;
            let flags = r.read_u8()?;
            if tracked_order {
                let _creation_order = r.read_u16(Endian::Little)?;
            }
            if r.remaining() < size as usize {
                return Err(Hdf5Error::Malformed("object header message size".to_owned()));
            }
            let body = r.read_bytes(size as usize)?;
            if crate::debug_enabled() {
                log::debug!(
                    "header message type {:#06x} at {:#x}, {} bytes",
                    message_type,
                    message_address,
                    size
                );
            }
            let message = parse_message(message_type, flags, body, sizes)?;
            if let Message::Continuation { address, length } = &message {
                // A continuation block opens with "OCHK" and closes with a
                // four-byte checksum.
                let body_start = address + 4;
                let body_len = length.saturating_sub(8);
                let sig = slice_at(hdf, *address, 4)?;
                if sig != b"OCHK" {
                    return Err(Hdf5Error::Malformed(
                        "object header continuation signature".to_owned(),
                    ));
                }
                blocks.push_back((body_start, body_len));
            }
            messages.push(message);
        }
    }

    Ok(ObjectHeader { version, messages })
}

fn parse_message(message_type: u16, flags: u8, body: &[u8], sizes: Sizes) -> Result<Message> {
    Ok(match message_type {
        MSG_NIL => Message::Nil,
        MSG_DATASPACE => Message::Dataspace(dataspace::dataspace(body, sizes.length)?.1),
        MSG_LINK_INFO => Message::LinkInfo(link::link_info(body, sizes)?),
        MSG_DATATYPE => Message::Datatype(body.to_vec()),
        MSG_FILL_VALUE_OLD => Message::FillValueOld(parse_fill_value_old(body)?),
        MSG_FILL_VALUE => Message::FillValue(parse_fill_value(body)?),
        MSG_LINK => Message::Link(link::link_message(body, sizes)?),
        MSG_LAYOUT => Message::Layout(layout::data_layout(body, sizes)?.1),
        MSG_GROUP_INFO => Message::GroupInfo,
        MSG_FILTER_PIPELINE => Message::FilterPipeline(layout::filter_pipeline(body)?.1),
        MSG_ATTRIBUTE => Message::Attribute(parse_attribute(body, sizes)?),
        MSG_CONTINUATION => {
            let mut r = ByteReader::new(body, sizes.offset, sizes.length);
            let address = r.read_offset()?;
            let length = r.read_length()?;
            Message::Continuation { address, length }
        }
        MSG_SYMBOL_TABLE => {
            let mut r = ByteReader::new(body, sizes.offset, sizes.length);
            let btree_address = r.read_offset()?;
            let heap_address = r.read_offset()?;
            Message::SymbolTable(SymbolTableMessage {
                btree_address,
                heap_address,
            })
        }
        MSG_MODIFICATION_TIME => {
            let mut r = ByteReader::new(body, sizes.offset, sizes.length);
            let version = r.read_u8()?;
            if version != 1 {
                return Err(Hdf5Error::UnsupportedVersion {
                    what: "modification time message",
                    version: u32::from(version),
                });
            }
            r.skip(3)?;
            Message::ModificationTime(r.read_u32(Endian::Little)?)
        }
        MSG_ATTRIBUTE_INFO => {
            let mut r = ByteReader::new(body, sizes.offset, sizes.length);
            let _version = r.read_u8()?;
            let info_flags = r.read_u8()?;
            if info_flags & 0x1 != 0 {
                let _max_creation_index = r.read_u16(Endian::Little)?;
            }
            let fractal_heap_address = r.read_offset()?;
            let name_btree_address = r.read_offset()?;
            Message::AttributeInfo(AttributeInfo {
                fractal_heap_address,
                name_btree_address,
            })
        }
        other => {
            // Message flag bit 7: fail rather than skip an unknown message.
            if flags & 0x80 != 0 {
                return Err(Hdf5Error::Malformed(format!(
                    "unknown mandatory header message {:#06x}",
                    other
                )));
            }
            Message::Unknown { type_code: other }
        }
    })
}

fn parse_fill_value_old(body: &[u8]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(body, 8, 8);
    let size = r.read_u32(Endian::Little)?;
    Ok(r.read_bytes(size as usize)?.to_vec())
}

fn parse_fill_value(body: &[u8]) -> Result<FillValue> {
    let mut r = ByteReader::new(body, 8, 8);
    let version = r.read_u8()?;
    match version {
        1 | 2 => {
            let _space_allocation_time = r.read_u8()?;
            let _write_time = r.read_u8()?;
            let defined = r.read_u8()? != 0;
            if version == 1 || defined {
                let size = r.read_u32(Endian::Little)?;
                let bytes = r.read_bytes(size as usize)?.to_vec();
                Ok(FillValue { defined, bytes })
            } else {
                Ok(FillValue {
                    defined,
                    bytes: Vec::new(),
                })
            }
        }
        3 => {
            let flags = r.read_u8()?;
            if flags & 0x20 != 0 {
                let size = r.read_u32(Endian::Little)?;
                let bytes = r.read_bytes(size as usize)?.to_vec();
                Ok(FillValue {
                    defined: true,
                    bytes,
                })
            } else {
                Ok(FillValue {
                    defined: false,
                    bytes: Vec::new(),
                })
            }
        }
        other => Err(Hdf5Error::UnsupportedVersion {
            what: "fill value message",
            version: u32::from(other),
        }),
    }
}

pub(crate) fn parse_attribute(body: &[u8], sizes: Sizes) -> Result<AttributeMessage> {
    let mut r = ByteReader::new(body, sizes.offset, sizes.length);
    let version = r.read_u8()?;
    let flags = match version {
        1 => {
            r.skip(1)?;
            0
        }
        2 | 3 => r.read_u8()?,
        other => {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "attribute message",
                version: u32::from(other),
            })
        }
    };
    if flags & 0x3 != 0 {
        return Err(Hdf5Error::UnsupportedDatatype(
            "shared attribute datatype or dataspace".to_owned(),
        ));
    }
    let name_size = r.read_u16(Endian::Little)?;
    let datatype_size = r.read_u16(Endian::Little)?;
    let dataspace_size = r.read_u16(Endian::Little)?;
    if version == 3 {
        let _charset = r.read_u8()?;
    }
    let padded = version == 1;
    let take_field = |r: &mut ByteReader, size: u16| -> Result<Vec<u8>> {
        let n = if padded { pad8(size) } else { size as usize };
        let bytes = r.read_bytes(n)?;
        Ok(bytes[..size as usize].to_vec())
    };

    let name_bytes = take_field(&mut r, name_size)?;
    let name: String = name_bytes
        .iter()
        .copied()
        .take_while(|b| *b != 0)
        .map(char::from)
        .collect();

    let datatype_bytes = take_field(&mut r, datatype_size)?;
    let datatype = datatype::parse(&datatype_bytes)?;

    let dataspace_bytes = take_field(&mut r, dataspace_size)?;
    let (_, dataspace) = dataspace::dataspace(&dataspace_bytes, sizes.length)?;

    let expected = datatype.element_size() * dataspace.element_count();
    let data = r.read_bytes(expected as usize)?.to_vec();

    Ok(AttributeMessage {
        name,
        datatype,
        dataspace,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn v1_message(message_type: u16, body: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&message_type.to_le_bytes());
        b.extend_from_slice(&(pad8(body.len() as u16) as u16).to_le_bytes());
        b.push(0);
        b.extend_from_slice(&[0, 0, 0]);
        b.extend_from_slice(body);
        b.resize(8 + pad8(body.len() as u16), 0);
        b
    }

    fn v1_header(messages: &[Vec<u8>]) -> Vec<u8> {
        let total: usize = messages.iter().map(|m| m.len()).sum();
        let mut b = vec![1u8, 0];
        b.extend_from_slice(&(messages.len() as u16).to_le_bytes());
        b.extend_from_slice(&1u32.to_le_bytes());
        b.extend_from_slice(&(total as u32).to_le_bytes());
        b.extend_from_slice(&[0u8; 4]);
        for m in messages {
            b.extend_from_slice(m);
        }
        b
    }

    fn dataspace_1d(n: u64) -> Vec<u8> {
        let mut b = vec![1u8, 1, 0, 0, 0, 0, 0, 0];
        b.extend_from_slice(&n.to_le_bytes());
        b
    }

    #[test]
    fn v1_header_with_symbol_table() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x88u64.to_le_bytes());
        body.extend_from_slice(&0x2A8u64.to_le_bytes());
        let header = v1_header(&[v1_message(MSG_SYMBOL_TABLE, &body)]);
        let oh = object_header(&header, 0, SIZES).unwrap();
        let st = oh.symbol_table().expect("symbol table message");
        assert_eq!(st.btree_address, 0x88);
        assert_eq!(st.heap_address, 0x2A8);
        assert!(!oh.is_dataset());
    }

    #[test]
    fn v1_continuation_is_inlined() {
        // First block: a dataspace and a continuation pointing at 256.
        let mut cont = Vec::new();
        cont.extend_from_slice(&256u64.to_le_bytes());
        cont.extend_from_slice(&24u64.to_le_bytes());
        let first = v1_header(&[
            v1_message(MSG_DATASPACE, &dataspace_1d(3)),
            v1_message(MSG_CONTINUATION, &cont),
        ]);
        let mut file = first.clone();
        file.resize(256, 0);
        file.extend_from_slice(&v1_message(MSG_MODIFICATION_TIME, &{
            let mut b = vec![1u8, 0, 0, 0];
            b.extend_from_slice(&7u32.to_le_bytes());
            b
        }));
        // Fix the message count: three messages total.
        file[2..4].copy_from_slice(&3u16.to_le_bytes());

        let oh = object_header(&file, 0, SIZES).unwrap();
        assert_eq!(oh.modification_time(), Some(7));
        assert!(oh.dataspace().is_some());
    }

    #[test]
    fn v1_attribute_message_parses() {
        let mut attr = vec![1u8, 0];
        attr.extend_from_slice(&6u16.to_le_bytes()); // "units\0"
        attr.extend_from_slice(&16u16.to_le_bytes()); // string datatype header
        attr.extend_from_slice(&8u16.to_le_bytes()); // scalar dataspace (v1 header)
        attr.extend_from_slice(b"units\0\0\0");
        // Fixed ASCII string of 7 bytes, null-terminated.
        let mut dt = vec![0x13, 0x00, 0, 0];
        dt.extend_from_slice(&7u32.to_le_bytes());
        dt.resize(16, 0);
        attr.extend_from_slice(&dt);
        let ds = vec![1u8, 0, 0, 0, 0, 0, 0, 0];
        attr.extend_from_slice(&ds);
        attr.extend_from_slice(b"meters\0");

        let header = v1_header(&[v1_message(MSG_ATTRIBUTE, &attr)]);
        let oh = object_header(&header, 0, SIZES).unwrap();
        let a = oh.attributes().next().expect("attribute");
        assert_eq!(a.name, "units");
        assert_eq!(a.data, b"meters\0");
    }

    #[test]
    fn v2_header_messages() {
        let mut b = Vec::new();
        b.extend_from_slice(b"OHDR");
        b.push(2);
        b.push(0); // flags: 1-byte chunk0 size, no times, no order
        let ds = dataspace_1d(4);
        let msg_len = 4 + ds.len();
        b.push(msg_len as u8);
        b.push(MSG_DATASPACE as u8);
        b.extend_from_slice(&(ds.len() as u16).to_le_bytes());
        b.push(0);
        b.extend_from_slice(&ds);
        b.extend_from_slice(&[0u8; 4]); // checksum
        let oh = object_header(&b, 0, SIZES).unwrap();
        assert_eq!(oh.version, 2);
        assert_eq!(oh.dataspace().unwrap().dims, [4]);
    }

    #[test]
    fn unknown_mandatory_message_fails() {
        let mut msg = v1_message(0x7F, &[0u8; 8]);
        msg[4] = 0x80; // flags: fail if unknown
        let header = v1_header(&[msg]);
        assert!(object_header(&header, 0, SIZES).is_err());
    }

    #[test]
    fn unknown_skippable_message_is_kept_as_unknown() {
        let header = v1_header(&[v1_message(0x7F, &[0u8; 8])]);
        let oh = object_header(&header, 0, SIZES).unwrap();
        match oh.messages.as_slice() {
            [Message::Unknown { type_code: 0x7F }] => {}
            other => panic!("unexpected messages {:?}", other),
        }
    }
}
