//! Advisory LRU cache for parsed metadata, owned by the file handle.
//!
//! Keys are (file-relative address, purpose). Every value is a pure
//! function of the file bytes, so a miss simply re-parses; a hit can never
//! disagree with a re-read.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::rc::Rc;

use lru::LruCache;

use crate::group::ChildLink;
use crate::parse::btree::ChunkEntry;
use crate::parse::datatype::Datatype;
use crate::parse::Superblock;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Superblock,
    Group,
    Datatype,
    BtreeNode,
}

#[derive(Clone)]
pub enum Cached {
    Superblock(Rc<Superblock>),
    Group(Rc<BTreeMap<String, ChildLink>>),
    Datatype(Rc<Datatype>),
    /// Enumerated chunk entries of one chunk index, in key order.
    Chunks(Rc<Vec<ChunkEntry>>),
}

pub struct MetaCache {
    inner: RefCell<LruCache<(u64, Purpose), Cached>>,
}

impl MetaCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        MetaCache {
            inner: RefCell::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, address: u64, purpose: Purpose) -> Option<Cached> {
        self.inner.borrow_mut().get(&(address, purpose)).cloned()
    }

    pub fn put(&self, address: u64, purpose: Purpose, value: Cached) {
        self.inner.borrow_mut().put((address, purpose), value);
    }

    pub fn group(&self, address: u64) -> Option<Rc<BTreeMap<String, ChildLink>>> {
        match self.get(address, Purpose::Group) {
            Some(Cached::Group(g)) => Some(g),
            _ => None,
        }
    }

    pub fn datatype(&self, address: u64) -> Option<Rc<Datatype>> {
        match self.get(address, Purpose::Datatype) {
            Some(Cached::Datatype(d)) => Some(d),
            _ => None,
        }
    }

    pub fn chunks(&self, address: u64) -> Option<Rc<Vec<ChunkEntry>>> {
        match self.get(address, Purpose::BtreeNode) {
            Some(Cached::Chunks(c)) => Some(c),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtype() -> Rc<Datatype> {
        Rc::new(Datatype {
            size: 8,
            class: crate::parse::datatype::DatatypeClass::FloatingPoint {
                order: crate::parse::datatype::Order::Little,
            },
        })
    }

    #[test]
    fn hit_after_put() {
        let cache = MetaCache::new(4);
        cache.put(0x100, Purpose::Datatype, Cached::Datatype(dtype()));
        assert!(cache.datatype(0x100).is_some());
        // Same address under a different purpose is a distinct key.
        assert!(cache.group(0x100).is_none());
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = MetaCache::new(2);
        cache.put(1, Purpose::Datatype, Cached::Datatype(dtype()));
        cache.put(2, Purpose::Datatype, Cached::Datatype(dtype()));
        // Touch 1 so that 2 becomes the eviction candidate.
        assert!(cache.datatype(1).is_some());
        cache.put(3, Purpose::Datatype, Cached::Datatype(dtype()));
        assert!(cache.datatype(1).is_some());
        assert!(cache.datatype(2).is_none());
        assert!(cache.datatype(3).is_some());
        assert_eq!(cache.len(), 2);
    }
}
