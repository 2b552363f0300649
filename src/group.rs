//! Group navigation: one child-lookup interface over old-style symbol
//! tables and new-style link storage, plus path resolution.
//!
//! Groups are value handles carrying an object header address; nothing
//! here builds an owned graph of group nodes, so cyclic soft links cannot
//! produce a cyclic ownership structure. Cycle detection during path
//! resolution is a visited set of absolute paths.

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use crate::cache::{Cached, MetaCache, Purpose};
use crate::error::{Hdf5Error, Result};
use crate::parse::btree::walk_group_leaves;
use crate::parse::heap::{heap_string, local_heap, symbol_table_node};
use crate::parse::link::{dense_links, LinkTarget};
use crate::parse::object::{object_header, ObjectHeader};
use crate::parse::Sizes;
use crate::reader::slice_from;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Group,
    Dataset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildLink {
    /// Object header address of the child.
    Hard(u64),
    /// Path to re-resolve from the root (or the owning group).
    Soft(String),
    External { file: String, object: String },
}

/// The resolved target of a path.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    pub kind: ChildKind,
    pub address: u64,
}

/// Build (or fetch from cache) the child map of the group whose object
/// header lives at `address`. Keys iterate in byte-lexicographic order.
pub fn children_of(
    hdf: &[u8],
    sizes: Sizes,
    cache: &MetaCache,
    address: u64,
) -> Result<Rc<BTreeMap<String, ChildLink>>> {
    if let Some(children) = cache.group(address) {
        return Ok(children);
    }
    let header = object_header(hdf, address, sizes)?;
    let children = Rc::new(children_from_header(hdf, sizes, &header)?);
    cache.put(address, Purpose::Group, Cached::Group(children.clone()));
    Ok(children)
}

fn children_from_header(
    hdf: &[u8],
    sizes: Sizes,
    header: &ObjectHeader,
) -> Result<BTreeMap<String, ChildLink>> {
    let mut children = BTreeMap::new();

    if let Some(st) = header.symbol_table() {
        // Old-style group: B-tree of SNODs plus a local heap of names.
        let (_, heap) = local_heap(slice_from(hdf, st.heap_address)?, sizes)?;
        for snod_address in walk_group_leaves(hdf, st.btree_address, sizes)? {
            let (_, snod) = symbol_table_node(slice_from(hdf, snod_address)?, sizes)?;
            for entry in &snod.entries {
                let name = heap_string(hdf, &heap, entry.link_name_offset)?;
                let link = if entry.cache_type == 2 {
                    // The scratch field caches the heap offset of the
                    // symbolic link target.
                    ChildLink::Soft(heap_string(hdf, &heap, u64::from(entry.link_value_offset))?)
                } else {
                    ChildLink::Hard(entry.object_header_address)
                };
                if children.insert(name, link).is_some() {
                    return Err(Hdf5Error::Malformed("duplicate link name".to_owned()));
                }
            }
        }
        return Ok(children);
    }

    // New-style group: inline link messages, or dense storage behind the
    // link info message.
    let mut links: Vec<_> = header.links().cloned().collect();
    if links.is_empty() {
        if let Some(info) = header.link_info() {
            if info.is_dense() {
                links = dense_links(hdf, info, sizes)?;
            }
        }
    }
    for link in links {
        let target = match link.target {
            LinkTarget::Hard(addr) => ChildLink::Hard(addr),
            LinkTarget::Soft(path) => ChildLink::Soft(path),
            LinkTarget::External { file, object } => ChildLink::External { file, object },
        };
        if children.insert(link.name, target).is_some() {
            return Err(Hdf5Error::Malformed("duplicate link name".to_owned()));
        }
    }
    Ok(children)
}

/// Child names in presentation order: symbol-table groups list in
/// byte-lexicographic order, link-message groups in creation order when
/// every link tracks one.
pub fn child_names(hdf: &[u8], sizes: Sizes, cache: &MetaCache, address: u64) -> Result<Vec<String>> {
    let header = object_header(hdf, address, sizes)?;
    if header.symbol_table().is_none() {
        let mut links: Vec<_> = header.links().cloned().collect();
        if links.is_empty() {
            if let Some(info) = header.link_info() {
                if info.is_dense() {
                    links = dense_links(hdf, info, sizes)?;
                }
            }
        }
        if !links.is_empty() {
            if links.iter().all(|l| l.creation_order.is_some()) {
                links.sort_by_key(|l| l.creation_order);
            } else {
                links.sort_by(|a, b| a.name.cmp(&b.name));
            }
            return Ok(links.into_iter().map(|l| l.name).collect());
        }
    }
    let children = children_of(hdf, sizes, cache, address)?;
    Ok(children.keys().cloned().collect())
}

/// Probe whether the object at `address` is a dataset or a group.
pub fn child_kind(hdf: &[u8], sizes: Sizes, address: u64) -> Result<ChildKind> {
    let header = object_header(hdf, address, sizes)?;
    Ok(if header.is_dataset() {
        ChildKind::Dataset
    } else {
        ChildKind::Group
    })
}

/// Split an absolute path into segments, rejecting empty ones.
fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn join(parts: &[String]) -> String {
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Resolve an absolute path to its target object, transparently following
/// soft links. Revisiting an absolute path fails with a link cycle.
pub fn resolve_path(
    hdf: &[u8],
    sizes: Sizes,
    cache: &MetaCache,
    root_address: u64,
    path: &str,
) -> Result<Resolved> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut parts = segments(path);

    // A chain of links that keeps growing the path never revisits the
    // same string, so bound the number of rewrites as well.
    for _ in 0..64 {
        if !visited.insert(join(&parts)) {
            return Err(Hdf5Error::LinkCycle { path: join(&parts) });
        }
        match walk(hdf, sizes, cache, root_address, &parts)? {
            Step::Done(resolved) => return Ok(resolved),
            Step::Rewritten(new_parts) => parts = new_parts,
        }
    }
    Err(Hdf5Error::LinkCycle {
        path: path.to_owned(),
    })
}

enum Step {
    Done(Resolved),
    /// A soft link replaced the walked prefix; resolution restarts on the
    /// rewritten absolute path.
    Rewritten(Vec<String>),
}

fn walk(
    hdf: &[u8],
    sizes: Sizes,
    cache: &MetaCache,
    root_address: u64,
    parts: &[String],
) -> Result<Step> {
    if parts.is_empty() {
        return Ok(Step::Done(Resolved {
            kind: ChildKind::Group,
            address: root_address,
        }));
    }

    let mut current = root_address;
    for (i, name) in parts.iter().enumerate() {
        let children = children_of(hdf, sizes, cache, current)?;
        let link = children.get(name).ok_or_else(|| Hdf5Error::PathNotFound {
            path: join(&parts[..=i]),
        })?;
        match link {
            ChildLink::Hard(addr) => {
                let last = i + 1 == parts.len();
                if last {
                    return Ok(Step::Done(Resolved {
                        kind: child_kind(hdf, sizes, *addr)?,
                        address: *addr,
                    }));
                }
                if child_kind(hdf, sizes, *addr)? != ChildKind::Group {
                    return Err(Hdf5Error::NotAGroup {
                        path: join(&parts[..=i]),
                    });
                }
                current = *addr;
            }
            ChildLink::Soft(target) => {
                // Rebuild the absolute path: the link target replaces the
                // walked prefix; relative targets are anchored at the
                // link's parent group.
                let mut rewritten: Vec<String> = if target.starts_with('/') {
                    segments(target)
                } else {
                    let mut p = parts[..i].to_vec();
                    p.extend(segments(target));
                    p
                };
                rewritten.extend_from_slice(&parts[i + 1..]);
                return Ok(Step::Rewritten(rewritten));
            }
            ChildLink::External { file, .. } => {
                return Err(Hdf5Error::UnsupportedExternalLink { file: file.clone() })
            }
        }
    }
    unreachable!("loop returns on the last segment");
}
