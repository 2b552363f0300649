//! Minimal HDF5 writer: one contiguous dataset under the root group, with
//! optional attributes.
//!
//! The emitted shape is fixed: a version-0 superblock with 8-byte offsets
//! and lengths, a root group whose symbol table holds exactly one entry, a
//! local heap carrying the dataset name, and a version-1 dataset object
//! header followed by the raw data. Everything beyond that subset
//! (chunking, filters, variable-length or compound types, more than one
//! dataset) is rejected as an unsupported write shape.

use crate::error::{Hdf5Error, Result};
use crate::parse::datatype::{encode, Datatype, DatatypeClass};
use crate::parse::{pad8, SIGNATURE};

/// An attribute to attach to the written dataset.
#[derive(Debug, Clone)]
pub struct WriteAttribute {
    pub name: String,
    pub dtype: Datatype,
    /// Empty shape writes a scalar attribute.
    pub shape: Vec<u64>,
    /// Row-major element bytes.
    pub data: Vec<u8>,
}

const UNDEFINED: u64 = u64::MAX;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, position: u64) {
    debug_assert!(out.len() as u64 <= position);
    out.resize(position as usize, 0);
}

/// Assemble a complete HDF5 byte image holding `data` as dataset
/// `/<name>`.
pub fn build(
    name: &str,
    dtype: &Datatype,
    shape: &[u64],
    data: &[u8],
    attributes: &[WriteAttribute],
) -> Result<Vec<u8>> {
    if name.is_empty() || name.contains('/') {
        return Err(Hdf5Error::UnsupportedWriteShape("dataset name"));
    }
    let datatype_body =
        encode::datatype_message(dtype).ok_or(Hdf5Error::UnsupportedWriteShape("datatype"))?;
    let element_count: u64 = if shape.is_empty() {
        1
    } else {
        shape.iter().product()
    };
    let needed = dtype.element_size() * element_count;
    if data.len() as u64 != needed {
        return Err(Hdf5Error::UnsupportedWriteShape("payload size"));
    }

    let mut attribute_bodies = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        attribute_bodies.push(attribute_message(attribute)?);
    }

    // Fixed-size pieces first, so every address is known before emission.
    let superblock_len = 96u64;
    let root_header_addr = superblock_len;
    let root_header_len = 16 + 8 + 16; // prefix + symbol table message
    let btree_addr = root_header_addr + root_header_len;
    let btree_len = 24 + 8 + 8 + 8; // node header + key, child, key
    let heap_addr = btree_addr + btree_len;
    let heap_header_len = 32u64;
    let segment_addr = heap_addr + heap_header_len;
    let name_offset = 8u64; // offset 0 holds the empty string
    let segment_len = name_offset + pad8(name.len() as u16 + 1) as u64;
    let snod_addr = segment_addr + segment_len;
    let snod_len = 8 + 40u64;
    let dataset_header_addr = snod_addr + snod_len;

    // Message bodies of the dataset header, in emission order.
    let mut messages: Vec<(u16, Vec<u8>)> = Vec::new();
    messages.push((0x1, dataspace_message(shape)));
    messages.push((0x3, datatype_body));
    messages.push((0x5, fill_value_message()));
    // The layout message is position-dependent; reserve its slot and
    // patch the address once the header size is known.
    let layout_index = messages.len();
    messages.push((0x8, layout_message(0, needed)));
    for body in attribute_bodies {
        messages.push((0xC, body));
    }

    let dataset_header_len: u64 = 16
        + messages
            .iter()
            .map(|(_, body)| 8 + pad8(body.len() as u16) as u64)
            .sum::<u64>();
    let data_addr = align8(dataset_header_addr + dataset_header_len);
    messages[layout_index].1 = layout_message(data_addr, needed);
    let end_of_file = data_addr + data.len() as u64;

    let mut out = Vec::with_capacity(end_of_file as usize);

    // Superblock, version 0.
    out.extend_from_slice(&SIGNATURE);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
    put_u16(&mut out, 4); // group leaf node K
    put_u16(&mut out, 16); // group internal node K
    put_u32(&mut out, 0); // file consistency flags
    put_u64(&mut out, 0); // base address
    put_u64(&mut out, UNDEFINED); // free-space info
    put_u64(&mut out, end_of_file);
    put_u64(&mut out, UNDEFINED); // driver info
    // Root group symbol table entry, cache type 1 with the B-tree and
    // heap addresses in the scratch space.
    put_u64(&mut out, 0);
    put_u64(&mut out, root_header_addr);
    put_u32(&mut out, 1);
    put_u32(&mut out, 0);
    put_u64(&mut out, btree_addr);
    put_u64(&mut out, heap_addr);
    debug_assert_eq!(out.len() as u64, superblock_len);

    // Root group object header: one symbol table message.
    out.push(1);
    out.push(0);
    put_u16(&mut out, 1);
    put_u32(&mut out, 1);
    put_u32(&mut out, 24); // header size
    out.extend_from_slice(&[0u8; 4]);
    put_u16(&mut out, 0x11);
    put_u16(&mut out, 16);
    out.extend_from_slice(&[0, 0, 0, 0]);
    put_u64(&mut out, btree_addr);
    put_u64(&mut out, heap_addr);
    debug_assert_eq!(out.len() as u64, btree_addr);

    // Group B-tree with a single SNOD leaf.
    out.extend_from_slice(b"TREE");
    out.push(0);
    out.push(0);
    put_u16(&mut out, 1);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, UNDEFINED);
    put_u64(&mut out, 0); // key: the empty string
    put_u64(&mut out, snod_addr);
    put_u64(&mut out, name_offset); // trailing key
    debug_assert_eq!(out.len() as u64, heap_addr);

    // Local heap holding the dataset name.
    out.extend_from_slice(b"HEAP");
    out.push(0);
    out.extend_from_slice(&[0, 0, 0]);
    put_u64(&mut out, segment_len);
    put_u64(&mut out, 1); // no free list
    put_u64(&mut out, segment_addr);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad_to(&mut out, snod_addr);

    // SNOD with one entry for the dataset.
    out.extend_from_slice(b"SNOD");
    out.push(1);
    out.push(0);
    put_u16(&mut out, 1);
    put_u64(&mut out, name_offset);
    put_u64(&mut out, dataset_header_addr);
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);
    out.extend_from_slice(&[0u8; 16]);
    debug_assert_eq!(out.len() as u64, dataset_header_addr);

    // Dataset object header.
    out.push(1);
    out.push(0);
    put_u16(&mut out, messages.len() as u16);
    put_u32(&mut out, 1);
    put_u32(&mut out, (dataset_header_len - 16) as u32);
    out.extend_from_slice(&[0u8; 4]);
    for (message_type, body) in &messages {
        let padded = pad8(body.len() as u16);
        put_u16(&mut out, *message_type);
        put_u16(&mut out, padded as u16);
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(body);
        out.resize(out.len() + (padded - body.len()), 0);
    }

    // Raw data, 8-aligned.
    pad_to(&mut out, data_addr);
    out.extend_from_slice(data);
    debug_assert_eq!(out.len() as u64, end_of_file);

    Ok(out)
}

fn align8(n: u64) -> u64 {
    (n + 7) / 8 * 8
}

/// Simple dataspace, current dims equal to max dims.
fn dataspace_message(shape: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1);
    body.push(shape.len() as u8);
    body.push(if shape.is_empty() { 0 } else { 1 });
    body.extend_from_slice(&[0u8; 5]);
    for dim in shape {
        body.extend_from_slice(&dim.to_le_bytes());
    }
    for dim in shape {
        body.extend_from_slice(&dim.to_le_bytes());
    }
    body
}

/// Version-2 fill value: late allocation, no fill defined.
fn fill_value_message() -> Vec<u8> {
    vec![2, 2, 0, 0]
}

fn layout_message(address: u64, size: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(3);
    body.push(1); // contiguous
    body.extend_from_slice(&address.to_le_bytes());
    body.extend_from_slice(&size.to_le_bytes());
    body
}

fn attribute_message(attribute: &WriteAttribute) -> Result<Vec<u8>> {
    if attribute.name.is_empty() {
        return Err(Hdf5Error::UnsupportedWriteShape("attribute name"));
    }
    if matches!(attribute.dtype.class, DatatypeClass::VariableLength { .. }) {
        return Err(Hdf5Error::UnsupportedWriteShape("attribute datatype"));
    }
    let datatype_body = encode::datatype_message(&attribute.dtype)
        .ok_or(Hdf5Error::UnsupportedWriteShape("attribute datatype"))?;
    let count: u64 = if attribute.shape.is_empty() {
        1
    } else {
        attribute.shape.iter().product()
    };
    if attribute.data.len() as u64 != attribute.dtype.element_size() * count {
        return Err(Hdf5Error::UnsupportedWriteShape("attribute payload size"));
    }
    let dataspace_body = dataspace_message(&attribute.shape);

    let name_len = attribute.name.len() + 1;
    let mut body = Vec::new();
    body.push(1);
    body.push(0);
    put_u16(&mut body, name_len as u16);
    put_u16(&mut body, datatype_body.len() as u16);
    put_u16(&mut body, dataspace_body.len() as u16);
    body.extend_from_slice(attribute.name.as_bytes());
    body.push(0);
    body.resize(8 + pad8(name_len as u16), 0);
    body.extend_from_slice(&datatype_body);
    body.resize(8 + pad8(name_len as u16) + pad8(datatype_body.len() as u16), 0);
    body.extend_from_slice(&dataspace_body);
    body.resize(
        8 + pad8(name_len as u16)
            + pad8(datatype_body.len() as u16)
            + pad8(dataspace_body.len() as u16),
        0,
    );
    body.extend_from_slice(&attribute.data);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::datatype::Order;
    use crate::parse::{self, RootLocation};

    fn f64_type() -> Datatype {
        Datatype {
            size: 8,
            class: DatatypeClass::FloatingPoint {
                order: Order::Little,
            },
        }
    }

    fn sample() -> Vec<u8> {
        let mut data = Vec::new();
        for v in [1.0f64, 2.0, 3.0].iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        build("x", &f64_type(), &[3], &data, &[]).unwrap()
    }

    #[test]
    fn output_has_a_valid_superblock() {
        let image = sample();
        assert_eq!(parse::find_signature(&image), Some(0));
        let (_, sb) = parse::superblock(&image).unwrap();
        assert_eq!(sb.version, 0);
        assert_eq!(sb.offset_size, 8);
        assert_eq!(sb.end_of_file_address, image.len() as u64);
        match sb.root {
            RootLocation::SymbolTableEntry(entry) => assert_eq!(entry.cache_type, 1),
            RootLocation::ObjectHeader(_) => panic!("expected a v0 root entry"),
        }
    }

    #[test]
    fn data_payload_is_eight_aligned() {
        let image = sample();
        // The last 24 bytes are the three doubles, starting on an 8-byte
        // boundary.
        let data_start = image.len() - 24;
        assert_eq!(data_start % 8, 0);
        assert_eq!(&image[data_start..data_start + 8], &1.0f64.to_le_bytes());
    }

    #[test]
    fn rejects_slash_in_name() {
        match build("a/b", &f64_type(), &[1], &[0u8; 8], &[]) {
            Err(Hdf5Error::UnsupportedWriteShape(_)) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_mismatched_payload() {
        match build("x", &f64_type(), &[3], &[0u8; 8], &[]) {
            Err(Hdf5Error::UnsupportedWriteShape("payload size")) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_unsupported_datatype() {
        let dtype = Datatype {
            size: 16,
            class: DatatypeClass::Compound { members: vec![] },
        };
        match build("x", &dtype, &[1], &[0u8; 16], &[]) {
            Err(Hdf5Error::UnsupportedWriteShape("datatype")) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn scalar_attribute_roundtrips_through_own_parser() {
        let attr = WriteAttribute {
            name: "answer".to_owned(),
            dtype: Datatype {
                size: 4,
                class: DatatypeClass::FixedPoint {
                    order: Order::Little,
                    signed: true,
                    bit_offset: 0,
                    precision: 32,
                },
            },
            shape: vec![],
            data: 42i32.to_le_bytes().to_vec(),
        };
        let body = attribute_message(&attr).unwrap();
        let sizes = parse::Sizes {
            offset: 8,
            length: 8,
        };
        let parsed = crate::parse::object::parse_attribute(&body, sizes).unwrap();
        assert_eq!(parsed.name, "answer");
        assert_eq!(parsed.data, 42i32.to_le_bytes());
    }
}
