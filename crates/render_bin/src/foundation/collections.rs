//! Specialized collection types
//!
//! The bin hierarchy is a graph of doubly linked sibling lists with parent
//! back references. Every node lives in a [`SlotMap`] arena and links are
//! stable keys, so unlinking is O(1) and a stale key can never dangle.

use std::collections::HashSet;

pub use slotmap::{new_key_type, Key, SecondaryMap, SlotMap};

/// Previous/next sibling keys embedded in an arena node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Links<K: Key> {
    /// Previous sibling
    pub prev: Option<K>,
    /// Next sibling
    pub next: Option<K>,
}

/// Arena nodes that can be threaded onto a [`SiblingList`]
pub trait Linked<K: Key> {
    /// Sibling links of this node
    fn links(&self) -> &Links<K>;

    /// Mutable sibling links of this node
    fn links_mut(&mut self) -> &mut Links<K>;
}

/// Head/tail of an intrusive doubly linked list whose nodes live in an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingList<K: Key> {
    head: Option<K>,
    tail: Option<K>,
    len: usize,
}

impl<K: Key> Default for SiblingList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> SiblingList<K> {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of linked nodes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First node
    pub const fn head(&self) -> Option<K> {
        self.head
    }

    /// Last node
    pub const fn tail(&self) -> Option<K> {
        self.tail
    }

    /// Append a node at the tail
    pub fn push_back<T: Linked<K>>(&mut self, arena: &mut SlotMap<K, T>, key: K) {
        let old_tail = self.tail;
        let Some(node) = arena.get_mut(key) else {
            log::error!("push_back of a key that is not in the arena: {key:?}");
            return;
        };
        *node.links_mut() = Links {
            prev: old_tail,
            next: None,
        };
        match old_tail.and_then(|t| arena.get_mut(t)) {
            Some(tail) => tail.links_mut().next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    /// Link `key` directly in front of `at`, which must be on this list
    pub fn insert_before<T: Linked<K>>(&mut self, arena: &mut SlotMap<K, T>, at: K, key: K) {
        let Some(prev) = arena.get(at).map(|n| n.links().prev) else {
            self.push_back(arena, key);
            return;
        };
        let Some(node) = arena.get_mut(key) else {
            return;
        };
        *node.links_mut() = Links {
            prev,
            next: Some(at),
        };
        if let Some(anchor) = arena.get_mut(at) {
            anchor.links_mut().prev = Some(key);
        }
        match prev.and_then(|p| arena.get_mut(p)) {
            Some(p) => p.links_mut().next = Some(key),
            None => self.head = Some(key),
        }
        self.len += 1;
    }

    /// Unlink a node; the node itself stays in the arena
    pub fn unlink<T: Linked<K>>(&mut self, arena: &mut SlotMap<K, T>, key: K) {
        let Some(node) = arena.get_mut(key) else {
            return;
        };
        let Links { prev, next } = std::mem::take(node.links_mut());
        debug_assert!(
            prev.is_some() || self.head == Some(key),
            "unlinking a node that is not on this list"
        );
        match prev.and_then(|p| arena.get_mut(p)) {
            Some(p) => p.links_mut().next = next,
            None => self.head = next,
        }
        match next.and_then(|n| arena.get_mut(n)) {
            Some(n) => n.links_mut().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Move every node of `other` to the tail of this list, leaving `other` empty
    pub fn append<T: Linked<K>>(&mut self, arena: &mut SlotMap<K, T>, other: &mut Self) {
        let Some(other_head) = other.head else {
            return;
        };
        match self.tail.and_then(|t| arena.get_mut(t)) {
            Some(tail) => tail.links_mut().next = Some(other_head),
            None => self.head = Some(other_head),
        }
        if let Some(head) = arena.get_mut(other_head) {
            head.links_mut().prev = self.tail;
        }
        self.tail = other.tail;
        self.len += other.len;
        *other = Self::new();
    }

    /// Iterate nodes head to tail
    pub fn iter<'a, T: Linked<K>>(&self, arena: &'a SlotMap<K, T>) -> ListIter<'a, K, T> {
        ListIter {
            arena,
            cursor: self.head,
        }
    }

    /// Snapshot of the keys head to tail
    pub fn keys<T: Linked<K>>(&self, arena: &SlotMap<K, T>) -> Vec<K> {
        self.iter(arena).map(|(k, _)| k).collect()
    }
}

/// Iterator over a [`SiblingList`]
pub struct ListIter<'a, K: Key, T> {
    arena: &'a SlotMap<K, T>,
    cursor: Option<K>,
}

impl<'a, K: Key, T: Linked<K>> Iterator for ListIter<'a, K, T> {
    type Item = (K, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = self.arena.get(key)?;
        self.cursor = node.links().next;
        Some((key, node))
    }
}

/// Integer id pool that hands released ids back out before growing
#[derive(Debug, Default)]
pub struct IdPool {
    next: u32,
    free: Vec<u32>,
    live: HashSet<u32>,
}

impl IdPool {
    /// Create an empty pool; ids start at 1 so 0 never names a resource
    pub fn new() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
            live: HashSet::new(),
        }
    }

    /// Take an id, reusing a released one when possible
    pub fn allocate(&mut self) -> u32 {
        let id = self.free.pop().unwrap_or_else(|| {
            let id = self.next;
            self.next += 1;
            id
        });
        self.live.insert(id);
        id
    }

    /// Return an id; `false` if it was not live
    pub fn release(&mut self, id: u32) -> bool {
        if self.live.remove(&id) {
            self.free.push(id);
            true
        } else {
            false
        }
    }

    /// Whether `id` is currently handed out
    pub fn is_live(&self, id: u32) -> bool {
        self.live.contains(&id)
    }

    /// Number of ids currently handed out
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of released ids waiting for reuse
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    new_key_type! { struct NodeKey; }

    #[derive(Default)]
    struct Node {
        value: u32,
        links: Links<NodeKey>,
    }

    impl Linked<NodeKey> for Node {
        fn links(&self) -> &Links<NodeKey> {
            &self.links
        }
        fn links_mut(&mut self) -> &mut Links<NodeKey> {
            &mut self.links
        }
    }

    fn values(list: &SiblingList<NodeKey>, arena: &SlotMap<NodeKey, Node>) -> Vec<u32> {
        list.iter(arena).map(|(_, n)| n.value).collect()
    }

    #[test]
    fn test_push_unlink_append() {
        let mut arena = SlotMap::with_key();
        let keys: Vec<_> = (0..4).map(|value| arena.insert(Node { value, ..Default::default() })).collect();

        let mut live = SiblingList::new();
        let mut staged = SiblingList::new();
        live.push_back(&mut arena, keys[0]);
        live.push_back(&mut arena, keys[1]);
        staged.push_back(&mut arena, keys[2]);
        staged.push_back(&mut arena, keys[3]);

        live.unlink(&mut arena, keys[0]);
        assert_eq!(values(&live, &arena), vec![1]);

        live.append(&mut arena, &mut staged);
        assert!(staged.is_empty());
        assert_eq!(values(&live, &arena), vec![1, 2, 3]);
        assert_eq!(live.len(), 3);

        live.insert_before(&mut arena, keys[1], keys[0]);
        assert_eq!(values(&live, &arena), vec![0, 1, 2, 3]);
        assert_eq!(live.tail(), Some(keys[3]));
    }

    #[test]
    fn test_id_pool_reuse() {
        let mut pool = IdPool::new();
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.allocate(), a);
        assert_eq!(pool.live_count(), 2);
    }
}
