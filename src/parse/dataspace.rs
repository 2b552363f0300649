//! Dataspace message (type 0x0001): the shape of a dataset or attribute.

use nom::bytes::streaming::take;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::le_u8;

use super::{address, fail, Result};

/// Sentinel in a max-dimension slot meaning "unlimited".
pub const UNLIMITED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceKind {
    /// A single element, distinct from a one-element array.
    Scalar,
    Simple,
    /// No elements at all (version 2 only).
    Null,
}

#[derive(Debug, Clone)]
pub struct Dataspace {
    pub kind: DataspaceKind,
    pub dims: Vec<u64>,
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Dataspace {
            kind: DataspaceKind::Scalar,
            dims: Vec::new(),
            max_dims: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements described; 1 for a scalar, 0 for a null space.
    pub fn element_count(&self) -> u64 {
        match self.kind {
            DataspaceKind::Null => 0,
            DataspaceKind::Scalar => 1,
            DataspaceKind::Simple => self.dims.iter().product(),
        }
    }
}

/// Parse a dataspace message body, version 1 or 2.
pub fn dataspace(input: &[u8], length_size: u8) -> Result<Dataspace> {
    context("dataspace", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, dimensionality) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, kind) = match version {
            1 => {
                // One reserved byte, then four more.
                let (input, _) = take(5usize)(input)?;
                let kind = if dimensionality == 0 {
                    DataspaceKind::Scalar
                } else {
                    DataspaceKind::Simple
                };
                (input, kind)
            }
            2 => {
                let (input, ty) = le_u8(input)?;
                let kind = match ty {
                    0 => DataspaceKind::Scalar,
                    1 => DataspaceKind::Simple,
                    2 => DataspaceKind::Null,
                    _ => return fail(input, "dataspace type"),
                };
                (input, kind)
            }
            _ => return fail(input, "dataspace version"),
        };

        let (input, dims) = count(address(length_size), dimensionality as usize)(input)?;
        let (input, max_dims) = if flags & 0x1 != 0 {
            let (input, max_dims) = count(address(length_size), dimensionality as usize)(input)?;
            (input, Some(max_dims))
        } else {
            (input, None)
        };
        // flags bit 1 (permutation indices) was never implemented by the
        // format itself; any trailing list is ignored.

        Ok((
            input,
            Dataspace {
                kind,
                dims,
                max_dims,
            },
        ))
    })(input)
}
