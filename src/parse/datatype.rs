//! Datatype message (type 0x0003): element type of a dataset or attribute.
//!
//! The wire form is one class-and-version byte, three bitfield bytes, a
//! four-byte size, then class-specific properties. Nested types (compound
//! members, array and variable-length bases, enum bases) repeat the same
//! form inside the properties, so parsing is recursive over a cursor.

use crate::error::{Hdf5Error, Result};
use crate::reader::{ByteReader, Endian};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Little,
    Big,
}

impl Order {
    pub fn endian(self) -> Endian {
        match self {
            Order::Little => Endian::Little,
            Order::Big => Endian::Big,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPad {
    NullTerminate,
    NullPad,
    SpacePad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharSet {
    Ascii,
    Utf8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    /// Byte offset of this member within the record.
    pub offset: u32,
    pub ty: Datatype,
}

/// A parsed datatype: stored element size plus the class-specific shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Datatype {
    /// Size in bytes of one stored element, as declared on the wire.
    pub size: u32,
    pub class: DatatypeClass,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatatypeClass {
    FixedPoint {
        order: Order,
        signed: bool,
        bit_offset: u16,
        precision: u16,
    },
    /// IEEE 754 binary32 or binary64; other float layouts are rejected.
    FloatingPoint { order: Order },
    String {
        pad: StringPad,
        charset: CharSet,
    },
    Compound {
        members: Vec<CompoundMember>,
    },
    Reference {
        region: bool,
    },
    Enum {
        base: Box<Datatype>,
        /// Mapping from stored integer value to symbol name.
        members: Vec<(String, i64)>,
    },
    VariableLength {
        base: Box<Datatype>,
        is_string: bool,
        pad: StringPad,
        charset: CharSet,
    },
    Array {
        base: Box<Datatype>,
        dims: Vec<u32>,
    },
}

impl Datatype {
    /// Little-endian signed or unsigned integer of `size` bytes.
    pub fn int_le(size: u32, signed: bool) -> Self {
        Datatype {
            size,
            class: DatatypeClass::FixedPoint {
                order: Order::Little,
                signed,
                bit_offset: 0,
                precision: (size * 8) as u16,
            },
        }
    }

    /// Little-endian IEEE float of 4 or 8 bytes.
    pub fn float_le(size: u32) -> Self {
        Datatype {
            size,
            class: DatatypeClass::FloatingPoint {
                order: Order::Little,
            },
        }
    }

    /// Fixed-length null-terminated ASCII string.
    pub fn ascii_string(size: u32) -> Self {
        Datatype {
            size,
            class: DatatypeClass::String {
                pad: StringPad::NullTerminate,
                charset: CharSet::Ascii,
            },
        }
    }

    /// Size in bytes of one element as stored in the file.
    pub fn element_size(&self) -> u64 {
        u64::from(self.size)
    }

    pub fn is_variable_length_string(&self) -> bool {
        matches!(
            self.class,
            DatatypeClass::VariableLength { is_string: true, .. }
        )
    }

    /// Short human-readable name used by `inspect` and the dump binary.
    pub fn describe(&self) -> String {
        match &self.class {
            DatatypeClass::FixedPoint { signed, .. } => {
                let prefix = if *signed { "int" } else { "uint" };
                format!("{}{}", prefix, self.size * 8)
            }
            DatatypeClass::FloatingPoint { .. } => format!("float{}", self.size * 8),
            DatatypeClass::String { .. } => format!("string[{}]", self.size),
            DatatypeClass::VariableLength { is_string: true, .. } => "string".to_owned(),
            DatatypeClass::VariableLength { base, .. } => format!("vlen<{}>", base.describe()),
            DatatypeClass::Compound { members } => format!("compound[{}]", members.len()),
            DatatypeClass::Array { base, dims } => format!("{}{:?}", base.describe(), dims),
            DatatypeClass::Enum { base, .. } => format!("enum<{}>", base.describe()),
            DatatypeClass::Reference { region: false } => "object ref".to_owned(),
            DatatypeClass::Reference { region: true } => "region ref".to_owned(),
        }
    }
}

/// Parse a datatype message body. Trailing padding after the type is
/// permitted and ignored.
pub fn parse(body: &[u8]) -> Result<Datatype> {
    let mut r = ByteReader::new(body, 8, 8);
    read_datatype(&mut r)
}

/// Parse one datatype at the cursor, leaving the cursor just past it.
pub fn read_datatype(r: &mut ByteReader) -> Result<Datatype> {
    let class_and_version = r.read_u8()?;
    let version = class_and_version >> 4;
    let raw_class = class_and_version & 0x0F;
    if version == 0 || version > 3 {
        return Err(Hdf5Error::UnsupportedVersion {
            what: "datatype",
            version: u32::from(version),
        });
    }

    let b0 = r.read_u8()?;
    let b1 = r.read_u8()?;
    let _b2 = r.read_u8()?;
    let bits = u32::from(b0) | u32::from(b1) << 8;
    let size = r.read_u32(Endian::Little)?;

    let order = if bits & 0x1 == 0 {
        Order::Little
    } else {
        Order::Big
    };

    let class = match raw_class {
        0 => {
            let bit_offset = r.read_u16(Endian::Little)?;
            let precision = r.read_u16(Endian::Little)?;
            DatatypeClass::FixedPoint {
                order,
                signed: bits & 0x8 != 0,
                bit_offset,
                precision,
            }
        }
        1 => read_float_properties(r, order, size)?,
        3 => DatatypeClass::String {
            pad: string_pad(bits & 0xF)?,
            charset: charset((bits >> 4) & 0xF)?,
        },
        6 => {
            let member_count = (bits & 0xFFFF) as usize;
            let mut members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                members.push(read_compound_member(r, version, size)?);
            }
            validate_compound(&members, size)?;
            DatatypeClass::Compound { members }
        }
        7 => {
            let kind = bits & 0xF;
            if kind > 1 {
                return Err(Hdf5Error::UnsupportedDatatype(format!(
                    "reference type {}",
                    kind
                )));
            }
            DatatypeClass::Reference { region: kind == 1 }
        }
        8 => {
            let member_count = (bits & 0xFFFF) as usize;
            let base = Box::new(read_datatype(r)?);
            let name_padded = version < 3;
            let mut names = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                names.push(read_name(r, name_padded)?);
            }
            let mut members = Vec::with_capacity(member_count);
            for name in names {
                let value = read_enum_value(r, &base)?;
                members.push((name, value));
            }
            DatatypeClass::Enum { base, members }
        }
        9 => {
            let is_string = bits & 0xF == 1;
            let pad = string_pad((bits >> 4) & 0xF)?;
            let cs = charset((bits >> 8) & 0xF)?;
            let base = Box::new(read_datatype(r)?);
            DatatypeClass::VariableLength {
                base,
                is_string,
                pad,
                charset: cs,
            }
        }
        10 => {
            let rank = r.read_u8()?;
            if version < 3 {
                r.skip(3)?;
            }
            let mut dims = Vec::with_capacity(rank as usize);
            for _ in 0..rank {
                let d = r.read_u32(Endian::Little)?;
                if d == 0 {
                    return Err(Hdf5Error::Malformed("array datatype dimension".to_owned()));
                }
                dims.push(d);
            }
            if version < 3 {
                // Permutation indices, never used by the format.
                r.skip(4 * rank as usize)?;
            }
            let base = Box::new(read_datatype(r)?);
            DatatypeClass::Array { base, dims }
        }
        other => {
            return Err(Hdf5Error::UnsupportedDatatype(format!("class {}", other)));
        }
    };

    Ok(Datatype { size, class })
}

fn read_float_properties(r: &mut ByteReader, order: Order, size: u32) -> Result<DatatypeClass> {
    let _bit_offset = r.read_u16(Endian::Little)?;
    let precision = r.read_u16(Endian::Little)?;
    let exp_location = r.read_u8()?;
    let exp_size = r.read_u8()?;
    let mant_location = r.read_u8()?;
    let mant_size = r.read_u8()?;
    let exp_bias = r.read_u32(Endian::Little)?;

    let ieee = match size {
        4 => precision == 32 && exp_location == 23 && exp_size == 8 && mant_location == 0
            && mant_size == 23 && exp_bias == 127,
        8 => precision == 64 && exp_location == 52 && exp_size == 11 && mant_location == 0
            && mant_size == 52 && exp_bias == 1023,
        _ => false,
    };
    if !ieee {
        return Err(Hdf5Error::UnsupportedDatatype(format!(
            "non-IEEE float (size {}, precision {}, exponent {}+{}, bias {})",
            size, precision, exp_location, exp_size, exp_bias
        )));
    }
    Ok(DatatypeClass::FloatingPoint { order })
}

fn read_compound_member(r: &mut ByteReader, version: u8, parent_size: u32) -> Result<CompoundMember> {
    let name = read_name(r, version < 3)?;
    let offset = match version {
        1 | 2 => r.read_u32(Endian::Little)?,
        // Version 3 stores the offset in the fewest bytes that can hold
        // the parent's size.
        _ => {
            let width = bytes_needed(parent_size);
            let mut value = 0u32;
            for (i, b) in r.read_bytes(width)?.iter().enumerate() {
                value |= u32::from(*b) << (8 * i);
            }
            value
        }
    };
    if version == 1 {
        let _dimensionality = r.read_u8()?;
        r.skip(3)?;
        let _permutation = r.read_u32(Endian::Little)?;
        r.skip(4)?;
        // Four dimension sizes, meaningful only pre-1.4; the array class
        // replaced them.
        r.skip(16)?;
    }
    let ty = read_datatype(r)?;
    Ok(CompoundMember { name, offset, ty })
}

fn validate_compound(members: &[CompoundMember], size: u32) -> Result<()> {
    // Member extents must stay inside the record and not overlap.
    let mut extents: Vec<(u64, u64)> = members
        .iter()
        .map(|m| (u64::from(m.offset), u64::from(m.offset) + m.ty.element_size()))
        .collect();
    extents.sort();
    let mut prev_end = 0;
    for (start, end) in extents {
        if start < prev_end || end > u64::from(size) {
            return Err(Hdf5Error::Malformed("compound member layout".to_owned()));
        }
        prev_end = end;
    }
    Ok(())
}

fn read_enum_value(r: &mut ByteReader, base: &Datatype) -> Result<i64> {
    let (order, signed) = match &base.class {
        DatatypeClass::FixedPoint { order, signed, .. } => (*order, *signed),
        _ => {
            return Err(Hdf5Error::UnsupportedDatatype(
                "enum over a non-integer base".to_owned(),
            ))
        }
    };
    let endian = order.endian();
    Ok(match (base.size, signed) {
        (1, false) => i64::from(r.read_u8()?),
        (1, true) => i64::from(r.read_i8()?),
        (2, false) => i64::from(r.read_u16(endian)?),
        (2, true) => i64::from(r.read_i16(endian)?),
        (4, false) => i64::from(r.read_u32(endian)?),
        (4, true) => i64::from(r.read_i32(endian)?),
        (8, _) => r.read_i64(endian)?,
        _ => {
            return Err(Hdf5Error::UnsupportedDatatype(format!(
                "enum base width {}",
                base.size
            )))
        }
    })
}

/// Read a null-terminated name, optionally padded out to an 8-byte boundary
/// (datatype versions 1 and 2 pad, version 3 does not).
fn read_name(r: &mut ByteReader, padded: bool) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = r.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    if padded {
        let consumed = bytes.len() + 1;
        let aligned = (consumed + 7) / 8 * 8;
        r.skip(aligned - consumed)?;
    }
    String::from_utf8(bytes).map_err(|_| Hdf5Error::Malformed("datatype member name".to_owned()))
}

fn string_pad(raw: u32) -> Result<StringPad> {
    match raw {
        0 => Ok(StringPad::NullTerminate),
        1 => Ok(StringPad::NullPad),
        2 => Ok(StringPad::SpacePad),
        other => Err(Hdf5Error::UnsupportedDatatype(format!(
            "string padding {}",
            other
        ))),
    }
}

fn charset(raw: u32) -> Result<CharSet> {
    match raw {
        0 => Ok(CharSet::Ascii),
        1 => Ok(CharSet::Utf8),
        other => Err(Hdf5Error::UnsupportedDatatype(format!("charset {}", other))),
    }
}

fn bytes_needed(size: u32) -> usize {
    match size {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Encoding helpers used by the writer; version 1 wire form throughout.
pub mod encode {
    use super::{Datatype, DatatypeClass, Order, StringPad};

    /// Serialize the subset of datatypes the writer accepts. Returns the
    /// unpadded message body.
    pub fn datatype_message(dt: &Datatype) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        match &dt.class {
            DatatypeClass::FixedPoint { order, signed, .. } => {
                out.push(0x10); // version 1, class 0
                let mut bits = 0u8;
                if *order == Order::Big {
                    bits |= 0x1;
                }
                if *signed {
                    bits |= 0x8;
                }
                out.push(bits);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&dt.size.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // bit offset
                out.extend_from_slice(&((dt.size * 8) as u16).to_le_bytes());
            }
            DatatypeClass::FloatingPoint { order } => {
                out.push(0x11); // version 1, class 1
                let mut bits = 0u8;
                if *order == Order::Big {
                    bits |= 0x1;
                }
                // Sign bit location in the second bitfield byte.
                out.push(bits | 0x20);
                let sign_location = (dt.size * 8 - 1) as u8;
                out.push(sign_location);
                out.push(0);
                out.extend_from_slice(&dt.size.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes());
                out.extend_from_slice(&((dt.size * 8) as u16).to_le_bytes());
                let (exp_loc, exp_size, mant_size, bias): (u8, u8, u8, u32) = if dt.size == 4 {
                    (23, 8, 23, 127)
                } else {
                    (52, 11, 52, 1023)
                };
                out.push(exp_loc);
                out.push(exp_size);
                out.push(0);
                out.push(mant_size);
                out.extend_from_slice(&bias.to_le_bytes());
            }
            DatatypeClass::String { pad, .. } => {
                out.push(0x13); // version 1, class 3
                let bits = match pad {
                    StringPad::NullTerminate => 0u8,
                    StringPad::NullPad => 1,
                    StringPad::SpacePad => 2,
                };
                out.push(bits);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&dt.size.to_le_bytes());
            }
            _ => return None,
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_f64_type_bytes() -> Vec<u8> {
        // IEEE binary64, little-endian, as h5py writes it.
        let mut b = vec![0x11, 0x20, 63, 0];
        b.extend_from_slice(&8u32.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&64u16.to_le_bytes());
        b.extend_from_slice(&[52, 11, 0, 52]);
        b.extend_from_slice(&1023u32.to_le_bytes());
        b
    }

    #[test]
    fn parses_ieee_f64() {
        let dt = parse(&le_f64_type_bytes()).unwrap();
        assert_eq!(dt.size, 8);
        assert_eq!(
            dt.class,
            DatatypeClass::FloatingPoint {
                order: Order::Little
            }
        );
    }

    #[test]
    fn rejects_non_ieee_float() {
        let mut b = le_f64_type_bytes();
        b[16] = 10; // exponent size
        match parse(&b) {
            Err(Hdf5Error::UnsupportedDatatype(_)) => {}
            other => panic!("expected UnsupportedDatatype, got {:?}", other),
        }
    }

    #[test]
    fn parses_signed_int_and_describes_it() {
        let mut b = vec![0x10, 0x08, 0, 0];
        b.extend_from_slice(&4u32.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&32u16.to_le_bytes());
        let dt = parse(&b).unwrap();
        match dt.class {
            DatatypeClass::FixedPoint { signed: true, order: Order::Little, .. } => {}
            ref other => panic!("unexpected class {:?}", other),
        }
        assert_eq!(dt.describe(), "int32");
    }

    #[test]
    fn parses_fixed_string() {
        let mut b = vec![0x13, 0x00, 0, 0];
        b.extend_from_slice(&7u32.to_le_bytes());
        let dt = parse(&b).unwrap();
        assert_eq!(
            dt.class,
            DatatypeClass::String {
                pad: StringPad::NullTerminate,
                charset: CharSet::Ascii,
            }
        );
        assert_eq!(dt.element_size(), 7);
    }

    #[test]
    fn parses_vlen_string() {
        // Variable-length string over a one-byte base.
        let mut b = vec![0x19, 0x01, 0, 0];
        b.extend_from_slice(&16u32.to_le_bytes());
        b.extend_from_slice(&[0x10, 0x00, 0, 0]);
        b.extend_from_slice(&1u32.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&8u16.to_le_bytes());
        let dt = parse(&b).unwrap();
        assert!(dt.is_variable_length_string());
    }

    #[test]
    fn parses_compound_v1() {
        let mut b = vec![0x16, 0x02, 0, 0]; // two members
        b.extend_from_slice(&12u32.to_le_bytes());
        for (name, offset, size) in [("x", 0u32, 8u32), ("n", 8, 4)].iter() {
            let mut padded = name.as_bytes().to_vec();
            padded.resize(8, 0);
            b.extend_from_slice(&padded);
            b.extend_from_slice(&offset.to_le_bytes());
            b.push(0); // dimensionality
            b.extend_from_slice(&[0, 0, 0]);
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&[0u8; 16]);
            if *size == 8 {
                b.extend_from_slice(&le_f64_type_bytes());
            } else {
                b.extend_from_slice(&[0x10, 0x08, 0, 0]);
                b.extend_from_slice(&4u32.to_le_bytes());
                b.extend_from_slice(&0u16.to_le_bytes());
                b.extend_from_slice(&32u16.to_le_bytes());
            }
        }
        let dt = parse(&b).unwrap();
        match dt.class {
            DatatypeClass::Compound { ref members } => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].name, "x");
                assert_eq!(members[1].offset, 8);
            }
            ref other => panic!("unexpected class {:?}", other),
        }
    }

    #[test]
    fn overlapping_compound_members_rejected() {
        let mut b = vec![0x16, 0x02, 0, 0];
        b.extend_from_slice(&8u32.to_le_bytes());
        for (name, offset) in [("a", 0u32), ("b", 2)].iter() {
            let mut padded = name.as_bytes().to_vec();
            padded.resize(8, 0);
            b.extend_from_slice(&padded);
            b.extend_from_slice(&offset.to_le_bytes());
            b.push(0);
            b.extend_from_slice(&[0, 0, 0]);
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&0u32.to_le_bytes());
            b.extend_from_slice(&[0u8; 16]);
            b.extend_from_slice(&[0x10, 0x08, 0, 0]);
            b.extend_from_slice(&4u32.to_le_bytes());
            b.extend_from_slice(&0u16.to_le_bytes());
            b.extend_from_slice(&32u16.to_le_bytes());
        }
        assert!(parse(&b).is_err());
    }

    #[test]
    fn parses_enum() {
        let mut b = vec![0x28, 0x02, 0, 0]; // version 2, class 8, two members
        b.extend_from_slice(&4u32.to_le_bytes());
        // Base: int32.
        b.extend_from_slice(&[0x10, 0x08, 0, 0]);
        b.extend_from_slice(&4u32.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&32u16.to_le_bytes());
        for name in ["OFF", "ON"].iter() {
            let mut padded = name.as_bytes().to_vec();
            padded.resize(8, 0);
            b.extend_from_slice(&padded);
        }
        b.extend_from_slice(&0i32.to_le_bytes());
        b.extend_from_slice(&1i32.to_le_bytes());
        let dt = parse(&b).unwrap();
        match dt.class {
            DatatypeClass::Enum { ref members, .. } => {
                assert_eq!(members[0], ("OFF".to_owned(), 0));
                assert_eq!(members[1], ("ON".to_owned(), 1));
            }
            ref other => panic!("unexpected class {:?}", other),
        }
    }

    #[test]
    fn parses_array_type() {
        // Version 2 array of 3 x int32.
        let mut b = vec![0x2A, 0, 0, 0];
        b.extend_from_slice(&12u32.to_le_bytes());
        b.push(1); // rank
        b.extend_from_slice(&[0, 0, 0]);
        b.extend_from_slice(&3u32.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes()); // permutation
        b.extend_from_slice(&[0x10, 0x08, 0, 0]);
        b.extend_from_slice(&4u32.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&32u16.to_le_bytes());
        let dt = parse(&b).unwrap();
        match dt.class {
            DatatypeClass::Array { ref dims, .. } => assert_eq!(dims, &[3]),
            ref other => panic!("unexpected class {:?}", other),
        }
    }
}
