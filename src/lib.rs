//! A pure-Rust HDF5 library, built for speed.
//!
//! This library does not intend to support all features of HDF5: it reads
//! the metadata and data layouts found in files written by h5py, MATLAB
//! (v7.3 MAT-files) and similar producers, and writes a minimal single-
//! dataset container those tools can open. The file is memory-mapped on
//! open and all structures are parsed on demand.
//!
//! ```no_run
//! # fn main() -> Result<(), h5lite::Hdf5Error> {
//! let file = h5lite::open("data.h5")?;
//! let dataset = file.open_dataset("/x")?;
//! let values = dataset.read()?;
//! # Ok(())
//! # }
//! ```

use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

mod cache;
mod dataset;
mod error;
mod filters;
mod group;
mod parse;
mod reader;
mod value;
mod writer;

pub use error::{Hdf5Error, Result};
pub use group::ChildKind;
pub use parse::dataspace::{Dataspace, DataspaceKind};
pub use parse::datatype::{CharSet, Datatype, DatatypeClass, Order, StringPad};
pub use value::{DecodedValue, ElementArray, Scalar};
pub use writer::WriteAttribute;

use cache::{Cached, MetaCache, Purpose};
use group::ChildLink;
use parse::object::object_header;
use parse::{Sizes, Superblock};

/// Default ceiling on one decoded dataset, changeable per file handle.
const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Toggle the process-wide debug trace. When enabled, object header
/// parsing logs one line per message through the `log` crate.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

/// Whether the debug trace is currently enabled.
pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Convenience function for Hdf5File::open.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Hdf5File> {
    Hdf5File::open(path)
}

/// Write `data` as dataset `/<name>` of a fresh HDF5 file at `path`.
pub fn write<P: AsRef<Path>>(
    path: P,
    name: &str,
    dtype: &Datatype,
    shape: &[u64],
    data: &[u8],
    attributes: &[WriteAttribute],
) -> Result<()> {
    let image = writer::build(name, dtype, shape, data, attributes)
        .map_err(|e| e.in_context("write", name))?;
    std::fs::write(path.as_ref(), image).map_err(|source| Hdf5Error::FileAccess {
        path: path.as_ref().to_owned(),
        source,
    })
}

/// An opened HDF5 file.
pub struct Hdf5File {
    map: memmap::Mmap,
    path: PathBuf,
    base: u64,
    superblock: Superblock,
    cache: MetaCache,
    memory_budget: Cell<u64>,
}

impl Hdf5File {
    /// Open an HDF5 file.
    ///
    /// This memory-maps the file, locates the signature among the
    /// candidate offsets (0 for plain HDF5, 512 for MAT-file v7.3) and
    /// parses the superblock. Everything else is read lazily.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = std::fs::File::open(&path).map_err(|source| Hdf5Error::FileAccess {
            path: path.clone(),
            source,
        })?;
        let map = unsafe { memmap::Mmap::map(&file) }.map_err(|source| Hdf5Error::FileAccess {
            path: path.clone(),
            source,
        })?;

        let base = parse::find_signature(&map).ok_or(Hdf5Error::InvalidSignature)?;
        match map.get(base as usize + 8) {
            Some(v) if *v > 3 => {
                return Err(Hdf5Error::UnsupportedVersion {
                    what: "superblock",
                    version: u32::from(*v),
                })
            }
            _ => {}
        }
        let (_, superblock) = parse::superblock(&map[base as usize..])
            .map_err(Hdf5Error::from)
            .map_err(|e| e.in_context("open", &path.to_string_lossy()))?;
        let declared_end = base.checked_add(superblock.end_of_file_address);
        if declared_end.map_or(true, |end| end > map.len() as u64) {
            return Err(Hdf5Error::Malformed(
                "file is shorter than its declared end".to_owned(),
            ));
        }

        let cache = MetaCache::new(cache::DEFAULT_CAPACITY);
        cache.put(
            0,
            Purpose::Superblock,
            Cached::Superblock(std::rc::Rc::new(superblock.clone())),
        );

        Ok(Hdf5File {
            map,
            path,
            base,
            superblock,
            cache,
            memory_budget: Cell::new(DEFAULT_MEMORY_BUDGET),
        })
    }

    /// Close the file, releasing the mapping and the metadata cache.
    /// Dropping the handle has the same effect.
    pub fn close(self) {}

    /// Byte distance from the start of the file to the HDF5 signature.
    pub fn base_offset(&self) -> u64 {
        self.base
    }

    /// Cap the decoded size of a single dataset read. Reads that would
    /// need more fail with a shape-overflow error instead of allocating.
    pub fn set_memory_budget(&self, bytes: u64) {
        self.memory_budget.set(bytes);
    }

    /// The HDF5 region of the mapping: file-relative addresses index
    /// directly into this slice.
    fn hdf(&self) -> &[u8] {
        &self.map[self.base as usize..]
    }

    fn sizes(&self) -> Sizes {
        self.superblock.sizes()
    }

    fn root_address(&self) -> u64 {
        self.superblock.root_header_address()
    }

    /// The root group.
    pub fn root(&self) -> GroupHandle {
        GroupHandle {
            file: self,
            address: self.root_address(),
            path: "/".to_owned(),
        }
    }

    /// Names of the root group's children.
    pub fn list_root(&self) -> Result<Vec<String>> {
        self.root().children()
    }

    /// Open a group by absolute path, following soft links.
    pub fn open_group(&self, path: &str) -> Result<GroupHandle> {
        let resolved = group::resolve_path(
            self.hdf(),
            self.sizes(),
            &self.cache,
            self.root_address(),
            path,
        )
        .map_err(|e| e.in_context("open group", path))?;
        if resolved.kind != ChildKind::Group {
            return Err(Hdf5Error::NotAGroup {
                path: path.to_owned(),
            });
        }
        Ok(GroupHandle {
            file: self,
            address: resolved.address,
            path: path.to_owned(),
        })
    }

    /// Open a dataset by absolute path, following soft links.
    pub fn open_dataset(&self, path: &str) -> Result<DatasetHandle> {
        let resolved = group::resolve_path(
            self.hdf(),
            self.sizes(),
            &self.cache,
            self.root_address(),
            path,
        )
        .map_err(|e| e.in_context("open dataset", path))?;
        if resolved.kind != ChildKind::Dataset {
            return Err(Hdf5Error::NotADataset {
                path: path.to_owned(),
            });
        }
        let meta = dataset::load(self.hdf(), self.sizes(), &self.cache, resolved.address)
            .map_err(|e| e.in_context("open dataset", path))?;
        Ok(DatasetHandle {
            file: self,
            meta,
            path: path.to_owned(),
        })
    }

    /// Map every object in the file to a short description, depth-first.
    /// Soft and external links are listed but not followed.
    pub fn list_recursive(&self) -> Result<BTreeMap<String, EntryInfo>> {
        let mut out = BTreeMap::new();
        let mut visited = HashSet::new();
        self.visit(self.root_address(), "", &mut visited, &mut |path, info| {
            out.insert(path, info);
        })?;
        Ok(out)
    }

    /// Summarize the file's structure.
    pub fn inspect(&self) -> Result<FileSummary> {
        let mut summary = FileSummary {
            superblock_version: self.superblock.version,
            root_children: self.list_root()?,
            dataset_count: 0,
            group_count: 0,
            max_depth: 0,
            chunked_count: 0,
            compressed_count: 0,
        };
        let mut visited = HashSet::new();
        self.visit(self.root_address(), "", &mut visited, &mut |path, info| {
            let depth = path.matches('/').count();
            summary.max_depth = summary.max_depth.max(depth);
            match info.kind {
                ChildKind::Group => summary.group_count += 1,
                ChildKind::Dataset => {
                    summary.dataset_count += 1;
                    if info.chunked {
                        summary.chunked_count += 1;
                    }
                    if info.compressed {
                        summary.compressed_count += 1;
                    }
                }
            }
        })?;
        Ok(summary)
    }

    fn visit(
        &self,
        address: u64,
        path: &str,
        visited: &mut HashSet<u64>,
        emit: &mut dyn FnMut(String, EntryInfo),
    ) -> Result<()> {
        if !visited.insert(address) {
            return Ok(());
        }
        let children = group::children_of(self.hdf(), self.sizes(), &self.cache, address)?;
        for (name, link) in children.iter() {
            let child_path = format!("{}/{}", path, name);
            match link {
                ChildLink::Hard(addr) => {
                    match group::child_kind(self.hdf(), self.sizes(), *addr)? {
                        ChildKind::Dataset => {
                            let meta =
                                dataset::load(self.hdf(), self.sizes(), &self.cache, *addr)?;
                            emit(
                                child_path,
                                EntryInfo {
                                    kind: ChildKind::Dataset,
                                    shape: Some(meta.shape().to_vec()),
                                    dtype: Some(meta.dtype.describe()),
                                    chunked: meta.is_chunked(),
                                    compressed: meta.is_compressed(),
                                },
                            );
                        }
                        ChildKind::Group => {
                            emit(
                                child_path.clone(),
                                EntryInfo {
                                    kind: ChildKind::Group,
                                    shape: None,
                                    dtype: None,
                                    chunked: false,
                                    compressed: false,
                                },
                            );
                            self.visit(*addr, &child_path, visited, emit)?;
                        }
                    }
                }
                ChildLink::Soft(_) | ChildLink::External { .. } => {
                    emit(
                        child_path,
                        EntryInfo {
                            kind: ChildKind::Group,
                            shape: None,
                            dtype: Some("link".to_owned()),
                            chunked: false,
                            compressed: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hdf5File")
            .field("path", &self.path)
            .field("base_offset", &self.base)
            .field("superblock_version", &self.superblock.version)
            .field("children", &self.list_root().unwrap_or_default())
            .finish()
    }
}

/// One row of [`Hdf5File::list_recursive`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub kind: ChildKind,
    pub shape: Option<Vec<u64>>,
    pub dtype: Option<String>,
    pub chunked: bool,
    pub compressed: bool,
}

/// Output of [`Hdf5File::inspect`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    pub superblock_version: u8,
    pub root_children: Vec<String>,
    pub dataset_count: usize,
    pub group_count: usize,
    pub max_depth: usize,
    pub chunked_count: usize,
    pub compressed_count: usize,
}

/// A group within an open file.
pub struct GroupHandle<'f> {
    file: &'f Hdf5File,
    address: u64,
    path: String,
}

impl<'f> GroupHandle<'f> {
    /// Child names in the order the underlying storage defines.
    pub fn children(&self) -> Result<Vec<String>> {
        group::child_names(self.file.hdf(), self.file.sizes(), &self.file.cache, self.address)
            .map_err(|e| e.in_context("list group", &self.path))
    }

    /// Kind of the named child.
    pub fn child_kind(&self, name: &str) -> Result<ChildKind> {
        let children = group::children_of(
            self.file.hdf(),
            self.file.sizes(),
            &self.file.cache,
            self.address,
        )?;
        match children.get(name) {
            Some(ChildLink::Hard(addr)) => {
                group::child_kind(self.file.hdf(), self.file.sizes(), *addr)
            }
            Some(_) => Ok(ChildKind::Group),
            None => Err(Hdf5Error::PathNotFound {
                path: format!("{}/{}", self.path.trim_end_matches('/'), name),
            }),
        }
    }

    /// Names of the attributes on this group.
    pub fn attributes(&self) -> Result<Vec<String>> {
        let header = object_header(self.file.hdf(), self.address, self.file.sizes())?;
        Ok(header.attributes().map(|a| a.name.clone()).collect())
    }

    /// Decode one attribute by name.
    pub fn read_attribute(&self, name: &str) -> Result<DecodedValue> {
        let header = object_header(self.file.hdf(), self.address, self.file.sizes())?;
        read_attribute_from(&header, name, self.file).map_err(|e| {
            e.in_context("read attribute", &format!("{}@{}", self.path, name))
        })
    }
}

/// A dataset within an open file, materialized on open.
pub struct DatasetHandle<'f> {
    file: &'f Hdf5File,
    meta: dataset::DatasetMeta,
    path: String,
}

impl<'f> std::fmt::Debug for DatasetHandle<'f> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetHandle")
            .field("meta", &self.meta)
            .field("path", &self.path)
            .finish()
    }
}

impl<'f> DatasetHandle<'f> {
    pub fn shape(&self) -> &[u64] {
        self.meta.shape()
    }

    pub fn dtype(&self) -> &Datatype {
        &self.meta.dtype
    }

    /// Seconds since the epoch from the modification time message, when
    /// the producer recorded one.
    pub fn modification_time(&self) -> Option<u32> {
        self.meta.modification_time
    }

    /// Read the whole dataset.
    pub fn read(&self) -> Result<DecodedValue> {
        dataset::read(
            &self.meta,
            self.file.hdf(),
            self.file.sizes(),
            &self.file.cache,
            self.file.memory_budget.get(),
        )
        .map_err(|e| e.in_context("read dataset", &self.path))
    }

    /// Read and extract a flat vector of one primitive type.
    pub fn read_as<T: Hdf5Num>(&self) -> Result<Vec<T>> {
        let value = self.read()?;
        let described = self.meta.dtype.describe();
        let data = match value {
            DecodedValue::Scalar(_) => {
                return Err(Hdf5Error::UnsupportedDatatype(
                    "scalar dataset; use read()".to_owned(),
                ))
            }
            DecodedValue::OneD(data)
            | DecodedValue::TwoD { data, .. }
            | DecodedValue::NDim { data, .. } => data,
        };
        T::from_elements(data).ok_or(Hdf5Error::UnsupportedDatatype(described))
    }

    pub fn attributes(&self) -> Vec<String> {
        self.meta.attributes.iter().map(|a| a.name.clone()).collect()
    }

    pub fn read_attribute(&self, name: &str) -> Result<DecodedValue> {
        let attribute = self
            .meta
            .attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Hdf5Error::PathNotFound {
                path: format!("{}@{}", self.path, name),
            })?;
        decode_attribute(attribute, self.file)
            .map_err(|e| e.in_context("read attribute", &format!("{}@{}", self.path, name)))
    }
}

fn read_attribute_from(
    header: &parse::object::ObjectHeader,
    name: &str,
    file: &Hdf5File,
) -> Result<DecodedValue> {
    let attribute = header
        .attributes()
        .find(|a| a.name == name)
        .ok_or_else(|| Hdf5Error::PathNotFound {
            path: name.to_owned(),
        })?;
    decode_attribute(attribute, file)
}

fn decode_attribute(
    attribute: &parse::object::AttributeMessage,
    file: &Hdf5File,
) -> Result<DecodedValue> {
    let cx = value::DecodeCx {
        hdf: file.hdf(),
        sizes: file.sizes(),
    };
    let count = attribute.dataspace.element_count() as usize;
    let elements = value::decode_elements(&attribute.data, &attribute.datatype, count, &cx)?;
    value::shape_value(&attribute.dataspace.dims, elements)
}

/// Primitive element types that [`DatasetHandle::read_as`] can extract.
pub trait Hdf5Num: private::Sealed + Sized {
    fn from_elements(elements: ElementArray) -> Option<Vec<Self>>;
}

mod private {
    pub trait Sealed {}
    impl Sealed for i8 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

macro_rules! impl_hdf5_num {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Hdf5Num for $ty {
                fn from_elements(elements: ElementArray) -> Option<Vec<Self>> {
                    match elements {
                        ElementArray::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_hdf5_num! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
