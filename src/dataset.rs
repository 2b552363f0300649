//! Dataset assembly and the read path.
//!
//! A dataset is materialized from its object header (datatype, dataspace,
//! layout, filter pipeline, fill value, attributes), then read as one
//! logical array: contiguous and compact layouts decode directly, chunked
//! layouts enumerate the chunk index, undo the filter pipeline per chunk
//! and scatter each chunk into the output, trimming partial chunks and
//! leaving missing chunks at the fill value.

use std::rc::Rc;

use crate::cache::{Cached, MetaCache, Purpose};
use crate::error::{Hdf5Error, Result};
use crate::filters;
use crate::parse::btree::{walk_chunks, ChunkEntry};
use crate::parse::dataspace::Dataspace;
use crate::parse::datatype::{self, Datatype, DatatypeClass};
use crate::parse::layout::{DataLayout, FilterPipeline};
use crate::parse::object::{object_header, AttributeMessage};
use crate::parse::Sizes;
use crate::reader::{is_undefined, slice_at};
use crate::value::{self, DecodeCx, DecodedValue};

/// Parsed dataset metadata, immutable once materialized.
#[derive(Debug)]
pub struct DatasetMeta {
    /// Object header address this dataset was materialized from.
    pub address: u64,
    pub dtype: Datatype,
    pub dataspace: Dataspace,
    pub layout: DataLayout,
    pub filters: FilterPipeline,
    pub fill_value: Option<Vec<u8>>,
    pub attributes: Vec<AttributeMessage>,
    pub modification_time: Option<u32>,
}

impl DatasetMeta {
    pub fn shape(&self) -> &[u64] {
        &self.dataspace.dims
    }

    pub fn is_chunked(&self) -> bool {
        matches!(
            self.layout,
            DataLayout::Chunked { .. } | DataLayout::SingleChunk { .. }
        )
    }

    pub fn is_compressed(&self) -> bool {
        !self.filters.filters.is_empty()
    }
}

/// Materialize a dataset from its object header address.
pub fn load(hdf: &[u8], sizes: Sizes, cache: &MetaCache, address: u64) -> Result<DatasetMeta> {
    let header = object_header(hdf, address, sizes)?;

    let raw = header
        .datatype_raw()
        .ok_or_else(|| Hdf5Error::Malformed("dataset without a datatype".to_owned()))?;
    let dtype = match cache.datatype(address) {
        Some(cached) => (*cached).clone(),
        None => {
            let parsed = datatype::parse(raw)?;
            cache.put(
                address,
                Purpose::Datatype,
                Cached::Datatype(Rc::new(parsed.clone())),
            );
            parsed
        }
    };

    let dataspace = header
        .dataspace()
        .ok_or_else(|| Hdf5Error::Malformed("dataset without a dataspace".to_owned()))?
        .clone();
    let layout = header
        .layout()
        .ok_or_else(|| Hdf5Error::Malformed("dataset without a data layout".to_owned()))?
        .clone();
    let filters = header.filter_pipeline().cloned().unwrap_or_default();
    let fill_value = header
        .fill_value()
        .filter(|f| f.defined && !f.bytes.is_empty())
        .map(|f| f.bytes.clone());
    let attributes = header.attributes().cloned().collect();
    let modification_time = header.modification_time();

    Ok(DatasetMeta {
        address,
        dtype,
        dataspace,
        layout,
        filters,
        fill_value,
        attributes,
        modification_time,
    })
}

/// Read the whole dataset into one decoded value.
pub fn read(
    meta: &DatasetMeta,
    hdf: &[u8],
    sizes: Sizes,
    cache: &MetaCache,
    memory_budget: u64,
) -> Result<DecodedValue> {
    // An array element type adds its own dimensions to the logical shape
    // the host sees; storage stays laid out by the dataspace dims with
    // the full (array-included) element width.
    let (element_type, shape) = logical_shape(&meta.dtype, &meta.dataspace);
    let storage_element = meta.dtype.element_size();
    let storage_count: u64 = match meta.dataspace.kind {
        crate::parse::dataspace::DataspaceKind::Null => 0,
        _ => meta.dataspace.element_count(),
    };

    let needed = storage_element
        .checked_mul(storage_count)
        .ok_or(Hdf5Error::ShapeOverflow {
            needed: u64::MAX,
            budget: memory_budget,
        })?;
    if needed > memory_budget {
        return Err(Hdf5Error::ShapeOverflow {
            needed,
            budget: memory_budget,
        });
    }

    let raw = assemble_raw(
        meta,
        hdf,
        sizes,
        cache,
        storage_element,
        needed,
        &meta.dataspace.dims,
    )?;
    let decode_count: u64 = match meta.dataspace.kind {
        crate::parse::dataspace::DataspaceKind::Null => 0,
        _ if shape.is_empty() => 1,
        _ => shape.iter().product(),
    };
    let cx = DecodeCx { hdf, sizes };
    let elements = value::decode_elements(&raw, element_type, decode_count as usize, &cx)?;
    value::shape_value(&shape, elements)
}

/// Unwrap array element types into the logical shape.
fn logical_shape<'a>(dtype: &'a Datatype, dataspace: &Dataspace) -> (&'a Datatype, Vec<u64>) {
    let mut shape = dataspace.dims.clone();
    let mut element = dtype;
    while let DatatypeClass::Array { base, dims } = &element.class {
        shape.extend(dims.iter().map(|d| u64::from(*d)));
        element = &**base;
    }
    (element, shape)
}

fn assemble_raw(
    meta: &DatasetMeta,
    hdf: &[u8],
    sizes: Sizes,
    cache: &MetaCache,
    element_size: u64,
    needed: u64,
    shape: &[u64],
) -> Result<Vec<u8>> {
    match &meta.layout {
        DataLayout::Compact { data } => {
            if (data.len() as u64) < needed {
                return Err(Hdf5Error::Malformed("compact data size".to_owned()));
            }
            Ok(data[..needed as usize].to_vec())
        }
        DataLayout::Contiguous { address, size } => {
            if is_undefined(*address) {
                // Never allocated: the whole extent reads as fill.
                return Ok(filled_buffer(meta, element_size, needed));
            }
            if *size < needed {
                return Err(Hdf5Error::Malformed("contiguous data size".to_owned()));
            }
            Ok(slice_at(hdf, *address, needed)?.to_vec())
        }
        DataLayout::Chunked {
            chunk_dims,
            btree_address,
        } => {
            let chunk_shape = chunk_logical_dims(chunk_dims, shape.len())?;
            let entries = match cache.chunks(*btree_address) {
                Some(cached) => cached,
                None => {
                    let walked =
                        Rc::new(walk_chunks(hdf, *btree_address, sizes, chunk_dims.len())?);
                    cache.put(
                        *btree_address,
                        Purpose::BtreeNode,
                        Cached::Chunks(walked.clone()),
                    );
                    walked
                }
            };
            let mut out = filled_buffer(meta, element_size, needed);
            for entry in entries.iter() {
                scatter_chunk(
                    meta,
                    hdf,
                    entry,
                    &chunk_shape,
                    shape,
                    element_size,
                    &mut out,
                )?;
            }
            Ok(out)
        }
        DataLayout::SingleChunk {
            address,
            size,
            filter_mask,
            chunk_dims,
        } => {
            let chunk_shape = chunk_logical_dims(chunk_dims, shape.len())?;
            let natural: u64 =
                chunk_shape.iter().product::<u64>().max(1) * element_size;
            let stored = if meta.filters.filters.is_empty() {
                natural
            } else if *size > 0 {
                *size
            } else {
                natural
            };
            let mut out = filled_buffer(meta, element_size, needed);
            let entry = ChunkEntry {
                key: crate::parse::btree::ChunkKey {
                    nbytes: stored as u32,
                    filter_mask: *filter_mask,
                    offsets: vec![0; chunk_dims.len()],
                },
                address: *address,
            };
            scatter_chunk(meta, hdf, &entry, &chunk_shape, shape, element_size, &mut out)?;
            Ok(out)
        }
        DataLayout::UnsupportedIndex { index_type } => {
            Err(Hdf5Error::UnsupportedChunkIndex(*index_type))
        }
    }
}

/// Strip the trailing element-size slot and check rank agreement.
fn chunk_logical_dims(chunk_dims: &[u32], rank: usize) -> Result<Vec<u64>> {
    if chunk_dims.len() != rank + 1 {
        return Err(Hdf5Error::Malformed("chunk dimensionality".to_owned()));
    }
    Ok(chunk_dims[..rank].iter().map(|d| u64::from(*d)).collect())
}

fn filled_buffer(meta: &DatasetMeta, element_size: u64, needed: u64) -> Vec<u8> {
    match &meta.fill_value {
        Some(pattern) if pattern.len() as u64 == element_size && !pattern.is_empty() => {
            let mut out = Vec::with_capacity(needed as usize);
            while (out.len() as u64) < needed {
                out.extend_from_slice(pattern);
            }
            out.truncate(needed as usize);
            out
        }
        // Default fill: zero bytes, which decode to zero numbers and
        // empty strings.
        _ => vec![0u8; needed as usize],
    }
}

/// Copy one stored chunk into the logical output buffer, skipping the
/// out-of-bounds tail of partial edge chunks.
fn scatter_chunk(
    meta: &DatasetMeta,
    hdf: &[u8],
    entry: &ChunkEntry,
    chunk_shape: &[u64],
    shape: &[u64],
    element_size: u64,
    out: &mut [u8],
) -> Result<()> {
    let stored = slice_at(hdf, entry.address, u64::from(entry.key.nbytes))?.to_vec();
    let raw = filters::decode_pipeline(
        &meta.filters,
        stored,
        element_size,
        entry.key.filter_mask,
    )?;

    let chunk_elements: u64 = chunk_shape.iter().product::<u64>().max(1);
    let expected = chunk_elements * element_size;
    if raw.len() as u64 != expected {
        return Err(Hdf5Error::ChunkSizeMismatch {
            expected,
            actual: raw.len() as u64,
        });
    }

    let rank = shape.len();
    if rank == 0 {
        let n = element_size as usize;
        out[..n].copy_from_slice(&raw[..n]);
        return Ok(());
    }

    let origin = &entry.key.offsets[..rank];

    // Copy runs along the last axis; iterate odometer-style over the rest.
    let last_chunk = chunk_shape[rank - 1];
    let last_origin = origin[rank - 1];
    if last_origin >= shape[rank - 1] {
        return Ok(());
    }
    let run = last_chunk.min(shape[rank - 1] - last_origin);
    let run_bytes = (run * element_size) as usize;

    let mut index = vec![0u64; rank.saturating_sub(1)];
    'rows: loop {
        // Logical coordinates of this row; rows past the dataset edge are
        // dropped.
        let mut in_bounds = true;
        for k in 0..rank - 1 {
            if origin[k] + index[k] >= shape[k] {
                in_bounds = false;
                break;
            }
        }
        if in_bounds {
            let mut src = 0u64;
            for k in 0..rank - 1 {
                src = src * chunk_shape[k] + index[k];
            }
            let src_byte = (src * last_chunk * element_size) as usize;

            let mut dst = 0u64;
            for k in 0..rank - 1 {
                dst = dst * shape[k] + origin[k] + index[k];
            }
            dst = dst * shape[rank - 1] + last_origin;
            let dst_byte = (dst * element_size) as usize;

            out[dst_byte..dst_byte + run_bytes]
                .copy_from_slice(&raw[src_byte..src_byte + run_bytes]);
        }

        // Advance the odometer over the leading chunk dimensions.
        for k in (0..rank - 1).rev() {
            index[k] += 1;
            if index[k] < chunk_shape[k] {
                continue 'rows;
            }
            index[k] = 0;
        }
        break;
    }

    Ok(())
}
