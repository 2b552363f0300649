//! Typed decoding of raw element bytes into host values.
//!
//! The shape policy follows the host contract: rank 0 becomes a scalar,
//! rank 1 a flat sequence, rank 2 a rows-by-columns array, and anything
//! higher a (shape, row-major flat sequence) pair.

use crate::error::{Hdf5Error, Result};
use crate::parse::datatype::{CharSet, Datatype, DatatypeClass, StringPad};
use crate::parse::heap;
use crate::parse::Sizes;
use crate::reader::{ByteReader, Endian};

/// File context needed while decoding: variable-length elements point into
/// global heap collections elsewhere in the file.
#[derive(Clone, Copy)]
pub struct DecodeCx<'a> {
    pub hdf: &'a [u8],
    pub sizes: Sizes,
}

/// One decoded element of a non-uniform type.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Enum { value: i64, name: Option<String> },
    Compound(Vec<(String, Scalar)>),
    Array(Vec<Scalar>),
    /// Object reference: the target's object header address, resolved by
    /// the caller on demand.
    Reference(u64),
    /// Region reference, kept opaque.
    RegionReference(Vec<u8>),
}

/// A flat, row-major sequence of decoded elements.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementArray {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
    Enum {
        values: Vec<i64>,
        /// Name mapping carried alongside the decoded integers.
        names: Vec<(String, i64)>,
    },
    Mixed(Vec<Scalar>),
}

impl ElementArray {
    pub fn len(&self) -> usize {
        match self {
            ElementArray::I8(v) => v.len(),
            ElementArray::I16(v) => v.len(),
            ElementArray::I32(v) => v.len(),
            ElementArray::I64(v) => v.len(),
            ElementArray::U8(v) => v.len(),
            ElementArray::U16(v) => v.len(),
            ElementArray::U32(v) => v.len(),
            ElementArray::U64(v) => v.len(),
            ElementArray::F32(v) => v.len(),
            ElementArray::F64(v) => v.len(),
            ElementArray::Str(v) => v.len(),
            ElementArray::Enum { values, .. } => values.len(),
            ElementArray::Mixed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the single element of a scalar read.
    fn into_scalar(self) -> Option<Scalar> {
        if self.len() != 1 {
            return None;
        }
        Some(match self {
            ElementArray::I8(v) => Scalar::I8(v[0]),
            ElementArray::I16(v) => Scalar::I16(v[0]),
            ElementArray::I32(v) => Scalar::I32(v[0]),
            ElementArray::I64(v) => Scalar::I64(v[0]),
            ElementArray::U8(v) => Scalar::U8(v[0]),
            ElementArray::U16(v) => Scalar::U16(v[0]),
            ElementArray::U32(v) => Scalar::U32(v[0]),
            ElementArray::U64(v) => Scalar::U64(v[0]),
            ElementArray::F32(v) => Scalar::F32(v[0]),
            ElementArray::F64(v) => Scalar::F64(v[0]),
            ElementArray::Str(mut v) => Scalar::Str(v.remove(0)),
            ElementArray::Enum { values, names } => {
                let value = values[0];
                let name = names
                    .iter()
                    .find(|(_, v)| *v == value)
                    .map(|(n, _)| n.clone());
                Scalar::Enum { value, name }
            }
            ElementArray::Mixed(mut v) => v.remove(0),
        })
    }
}

/// What a dataset or attribute read hands to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Scalar(Scalar),
    OneD(ElementArray),
    TwoD {
        rows: u64,
        cols: u64,
        data: ElementArray,
    },
    NDim {
        shape: Vec<u64>,
        data: ElementArray,
    },
}

/// Wrap a flat element array according to the logical shape.
pub fn shape_value(shape: &[u64], data: ElementArray) -> Result<DecodedValue> {
    Ok(match shape.len() {
        0 => DecodedValue::Scalar(
            data.into_scalar()
                .ok_or_else(|| Hdf5Error::Malformed("scalar element count".to_owned()))?,
        ),
        1 => DecodedValue::OneD(data),
        2 => DecodedValue::TwoD {
            rows: shape[0],
            cols: shape[1],
            data,
        },
        _ => DecodedValue::NDim {
            shape: shape.to_vec(),
            data,
        },
    })
}

/// Decode `count` elements of `dtype` from a raw buffer.
pub fn decode_elements(
    bytes: &[u8],
    dtype: &Datatype,
    count: usize,
    cx: &DecodeCx,
) -> Result<ElementArray> {
    let width = dtype.element_size() as usize;
    if width == 0 && count > 0 {
        return Err(Hdf5Error::Malformed("zero-size element".to_owned()));
    }
    if bytes.len() < width * count {
        return Err(Hdf5Error::Malformed("element buffer size".to_owned()));
    }

    match &dtype.class {
        DatatypeClass::FixedPoint { order, signed, .. } => {
            let endian = order.endian();
            decode_fixed(bytes, width, count, endian, *signed)
        }
        DatatypeClass::FloatingPoint { order } => {
            let endian = order.endian();
            let mut r = ByteReader::new(bytes, cx.sizes.offset, cx.sizes.length);
            match width {
                4 => {
                    let mut out = Vec::with_capacity(count);
                    for _ in 0..count {
                        out.push(r.read_f32(endian)?);
                    }
                    Ok(ElementArray::F32(out))
                }
                8 => {
                    let mut out = Vec::with_capacity(count);
                    for _ in 0..count {
                        out.push(r.read_f64(endian)?);
                    }
                    Ok(ElementArray::F64(out))
                }
                other => Err(Hdf5Error::UnsupportedDatatype(format!(
                    "float width {}",
                    other
                ))),
            }
        }
        DatatypeClass::String { pad, charset } => {
            let mut out = Vec::with_capacity(count);
            for element in bytes.chunks_exact(width).take(count) {
                out.push(decode_fixed_string(element, *pad, *charset));
            }
            Ok(ElementArray::Str(out))
        }
        DatatypeClass::VariableLength {
            is_string: true,
            charset,
            ..
        } => {
            let mut out = Vec::with_capacity(count);
            for element in bytes.chunks_exact(width).take(count) {
                out.push(decode_vlen_string(element, *charset, cx)?);
            }
            Ok(ElementArray::Str(out))
        }
        DatatypeClass::VariableLength { .. } => Err(Hdf5Error::UnsupportedDatatype(
            "variable-length sequence".to_owned(),
        )),
        DatatypeClass::Enum { base, members } => {
            let base_values = decode_elements(bytes, base, count, cx)?;
            let values = match base_values {
                ElementArray::I8(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::I16(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::I32(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::I64(v) => v,
                ElementArray::U8(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::U16(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::U32(v) => v.into_iter().map(i64::from).collect(),
                ElementArray::U64(v) => v.into_iter().map(|x| x as i64).collect(),
                _ => {
                    return Err(Hdf5Error::UnsupportedDatatype(
                        "enum over a non-integer base".to_owned(),
                    ))
                }
            };
            Ok(ElementArray::Enum {
                values,
                names: members.clone(),
            })
        }
        DatatypeClass::Compound { .. }
        | DatatypeClass::Array { .. }
        | DatatypeClass::Reference { .. } => {
            let mut out = Vec::with_capacity(count);
            for element in bytes.chunks_exact(width).take(count) {
                out.push(decode_scalar(element, dtype, cx)?);
            }
            Ok(ElementArray::Mixed(out))
        }
    }
}

/// Decode a single element.
pub fn decode_scalar(bytes: &[u8], dtype: &Datatype, cx: &DecodeCx) -> Result<Scalar> {
    match &dtype.class {
        DatatypeClass::Compound { members } => {
            let mut fields = Vec::with_capacity(members.len());
            for member in members {
                let start = member.offset as usize;
                let end = start + member.ty.element_size() as usize;
                let slice = bytes
                    .get(start..end)
                    .ok_or_else(|| Hdf5Error::Malformed("compound record extent".to_owned()))?;
                fields.push((member.name.clone(), decode_scalar(slice, &member.ty, cx)?));
            }
            Ok(Scalar::Compound(fields))
        }
        DatatypeClass::Array { base, dims } => {
            let n: usize = dims.iter().map(|d| *d as usize).product();
            let base_width = base.element_size() as usize;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let slice = bytes
                    .get(i * base_width..(i + 1) * base_width)
                    .ok_or_else(|| Hdf5Error::Malformed("array element extent".to_owned()))?;
                items.push(decode_scalar(slice, base, cx)?);
            }
            Ok(Scalar::Array(items))
        }
        DatatypeClass::Reference { region: false } => {
            let mut r = ByteReader::new(bytes, cx.sizes.offset, cx.sizes.length);
            Ok(Scalar::Reference(r.read_offset()?))
        }
        DatatypeClass::Reference { region: true } => Ok(Scalar::RegionReference(bytes.to_vec())),
        _ => decode_elements(bytes, dtype, 1, cx)?
            .into_scalar()
            .ok_or_else(|| Hdf5Error::Malformed("scalar element".to_owned())),
    }
}

fn decode_fixed(
    bytes: &[u8],
    width: usize,
    count: usize,
    endian: Endian,
    signed: bool,
) -> Result<ElementArray> {
    let mut r = ByteReader::new(bytes, 8, 8);
    macro_rules! gather {
        ($read:ident, $variant:ident) => {{
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(r.$read(endian)?);
            }
            Ok(ElementArray::$variant(out))
        }};
    }
    match (width, signed) {
        (1, true) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(r.read_i8()?);
            }
            Ok(ElementArray::I8(out))
        }
        (1, false) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(r.read_u8()?);
            }
            Ok(ElementArray::U8(out))
        }
        (2, true) => gather!(read_i16, I16),
        (2, false) => gather!(read_u16, U16),
        (4, true) => gather!(read_i32, I32),
        (4, false) => gather!(read_u32, U32),
        (8, true) => gather!(read_i64, I64),
        (8, false) => gather!(read_u64, U64),
        (other, _) => Err(Hdf5Error::UnsupportedDatatype(format!(
            "integer width {}",
            other
        ))),
    }
}

fn decode_fixed_string(bytes: &[u8], pad: StringPad, charset: CharSet) -> String {
    let trimmed: &[u8] = match pad {
        StringPad::NullTerminate => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            &bytes[..end]
        }
        StringPad::NullPad => {
            let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            &bytes[..end]
        }
        StringPad::SpacePad => {
            let end = bytes.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
            &bytes[..end]
        }
    };
    let _ = charset;
    String::from_utf8_lossy(trimmed).into_owned()
}

/// A variable-length string element on disk: byte length, then the global
/// heap ID (collection address + object index) of the payload.
fn decode_vlen_string(element: &[u8], charset: CharSet, cx: &DecodeCx) -> Result<String> {
    let mut r = ByteReader::new(element, cx.sizes.offset, cx.sizes.length);
    let length = r.read_u32(Endian::Little)? as usize;
    let collection = r.read_offset()?;
    let index = r.read_u32(Endian::Little)?;
    let object = heap::global_heap_object(cx.hdf, collection, index, cx.sizes)?;
    let payload = object.get(..length.min(object.len())).unwrap_or(&object);
    let _ = charset;
    Ok(String::from_utf8_lossy(payload).into_owned())
}
