//! Data layout message (type 0x0008) and filter pipeline message (0x000B).

use nom::bytes::streaming::take;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use super::{address, fail, pad8, Result, Sizes};

/// Physical placement of dataset bytes.
#[derive(Debug, Clone)]
pub enum DataLayout {
    /// Payload embedded in the object header.
    Compact { data: Vec<u8> },
    Contiguous {
        address: u64,
        size: u64,
    },
    /// Chunk dimensions carry one trailing slot holding the element size.
    Chunked {
        chunk_dims: Vec<u32>,
        btree_address: u64,
    },
    /// Version-4 single-chunk index: the whole dataset is one chunk.
    SingleChunk {
        address: u64,
        size: u64,
        filter_mask: u32,
        chunk_dims: Vec<u32>,
    },
    /// Version-4 chunk index we do not read (implicit, fixed array,
    /// extensible array, v2 B-tree). Reading the dataset reports
    /// the index type to the caller.
    UnsupportedIndex { index_type: u8 },
}

pub fn data_layout(input: &[u8], sizes: Sizes) -> Result<DataLayout> {
    context("data layout", move |input| {
        let (input, version) = le_u8(input)?;
        match version {
            3 => data_layout_v3(input, sizes),
            4 => data_layout_v4(input, sizes),
            _ => fail(input, "data layout version"),
        }
    })(input)
}

fn data_layout_v3(input: &[u8], sizes: Sizes) -> Result<DataLayout> {
    let (input, layout_class) = le_u8(input)?;
    match layout_class {
        0 => {
            let (input, size) = le_u16(input)?;
            let (input, data) = take(size)(input)?;
            Ok((
                input,
                DataLayout::Compact {
                    data: data.to_vec(),
                },
            ))
        }
        1 => {
            let (input, data_address) = address(sizes.offset)(input)?;
            let (input, size) = address(sizes.length)(input)?;
            Ok((
                input,
                DataLayout::Contiguous {
                    address: data_address,
                    size,
                },
            ))
        }
        2 => {
            let (input, dimensionality) = le_u8(input)?;
            let (input, btree_address) = address(sizes.offset)(input)?;
            let (input, chunk_dims) = count(le_u32, dimensionality as usize)(input)?;
            if chunk_dims.iter().any(|d| *d == 0) {
                return fail(input, "chunk dimension");
            }
            Ok((
                input,
                DataLayout::Chunked {
                    chunk_dims,
                    btree_address,
                },
            ))
        }
        _ => fail(input, "data layout class"),
    }
}

fn data_layout_v4(input: &[u8], sizes: Sizes) -> Result<DataLayout> {
    let (input, layout_class) = le_u8(input)?;
    match layout_class {
        0 => {
            let (input, size) = le_u16(input)?;
            let (input, data) = take(size)(input)?;
            Ok((
                input,
                DataLayout::Compact {
                    data: data.to_vec(),
                },
            ))
        }
        1 => {
            let (input, data_address) = address(sizes.offset)(input)?;
            let (input, size) = address(sizes.length)(input)?;
            Ok((
                input,
                DataLayout::Contiguous {
                    address: data_address,
                    size,
                },
            ))
        }
        2 => {
            let (input, flags) = le_u8(input)?;
            let (input, dimensionality) = le_u8(input)?;
            let (input, dim_width) = le_u8(input)?;
            let (input, raw_dims) = count(address(dim_width), dimensionality as usize)(input)?;
            let chunk_dims: Vec<u32> = raw_dims.iter().map(|d| *d as u32).collect();
            if chunk_dims.iter().any(|d| *d == 0) {
                return fail(input, "chunk dimension");
            }
            let (input, index_type) = le_u8(input)?;
            match index_type {
                // Single chunk: the index is the chunk itself.
                1 => {
                    let (input, size, filter_mask) = if flags & 0x2 != 0 {
                        let (input, filtered_size) = address(sizes.length)(input)?;
                        let (input, filter_mask) = le_u32(input)?;
                        (input, filtered_size, filter_mask)
                    } else {
                        // Unfiltered: size is the chunk's natural byte count,
                        // which the caller reconstructs from the dims.
                        (input, 0, 0)
                    };
                    let (input, data_address) = address(sizes.offset)(input)?;
                    Ok((
                        input,
                        DataLayout::SingleChunk {
                            address: data_address,
                            size,
                            filter_mask,
                            chunk_dims,
                        },
                    ))
                }
                other => Ok((input, DataLayout::UnsupportedIndex { index_type: other })),
            }
        }
        _ => fail(input, "data layout class"),
    }
}

/// One entry of the filter pipeline.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub id: u16,
    pub name: String,
    /// Bit 0 of the flags: failure of this filter may be tolerated.
    pub optional: bool,
    pub client_data: Vec<u32>,
}

/// The ordered filter pipeline as recorded at write time. Reads must apply
/// the inverse filters in reverse order.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    pub filters: Vec<FilterSpec>,
}

pub fn filter_pipeline(input: &[u8]) -> Result<FilterPipeline> {
    context("filter pipeline", |input| {
        let (input, version) = le_u8(input)?;
        let (input, nfilters) = le_u8(input)?;
        let (mut input, _) = match version {
            1 => take(6usize)(input)?,
            2 => (input, &input[..0]),
            _ => return fail(input, "filter pipeline version"),
        };

        let mut filters = Vec::with_capacity(nfilters as usize);
        for _ in 0..nfilters {
            let (rest, spec) = filter_description(input, version)?;
            filters.push(spec);
            input = rest;
        }
        Ok((input, FilterPipeline { filters }))
    })(input)
}

fn filter_description(input: &[u8], version: u8) -> Result<FilterSpec> {
    context("filter description", move |input| {
        let (input, id) = le_u16(input)?;
        // Version 2 omits the name for built-in filters.
        let has_name = version == 1 || id >= 256;
        let (input, name_length) = if has_name {
            le_u16(input)?
        } else {
            (input, 0)
        };
        let (input, flags) = le_u16(input)?;
        let (input, n_client) = le_u16(input)?;
        let (input, name_bytes) = if version == 1 {
            take(pad8(name_length))(input)?
        } else {
            take(name_length)(input)?
        };
        let (input, client_data) = count(le_u32, n_client as usize)(input)?;
        // Version 1 pads an odd count of client words out to eight bytes.
        let (input, _) = if version == 1 && n_client % 2 == 1 {
            take(4usize)(input)?
        } else {
            (input, &input[..0])
        };

        let name = String::from_utf8_lossy(
            &name_bytes
                .iter()
                .copied()
                .take_while(|b| *b != 0)
                .collect::<Vec<u8>>(),
        )
        .into_owned();

        Ok((
            input,
            FilterSpec {
                id,
                name,
                optional: flags & 0x1 != 0,
                client_data,
            },
        ))
    })(input)
}
