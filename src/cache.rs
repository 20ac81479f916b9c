//! Bounded LRU cache with single-flight insertion.
//!
//! Values are created under the cache lock by a caller-supplied factory,
//! so a factory must return quickly; anything slow to initialize should
//! hand back an unready handle and complete in the background (see
//! [`crate::vhost::VirtualHost`]). Evicted, replaced and cleared values
//! get their finalizer invoked exactly once, after the lock is released.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Capabilities a cached value may opt into.
///
/// `is_expired` is consulted on every hit; an expired value is finalized
/// and rebuilt in place. `finalize` runs when a value leaves the cache
/// for any reason. Both default to no-ops.
pub trait CacheEntry {
    fn is_expired(&self) -> bool {
        false
    }

    fn finalize(&self) {}
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<K, V> {
    map: HashMap<K, usize>,
    // Slab of list nodes; freed slots are None and recorded in `free`.
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

/// LRU cache keyed by `K`, bounded to a fixed capacity.
///
/// All mutation happens under one mutex. Operations are O(1); the
/// critical section only ever runs the (non-blocking) factory and a few
/// pointer swaps.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + CacheEntry,
{
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be at least 1");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
        }
    }

    /// Returns the resident value for `key`, promoting it to
    /// most-recently-used, or inserts the factory's value at the front.
    ///
    /// An expired resident value is finalized and rebuilt by calling the
    /// factory again; the slot keeps its identity but moves to the front.
    /// Inserting beyond capacity evicts and finalizes the LRU tail.
    pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        let mut retired: Vec<V> = Vec::new();
        let value = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            if let Some(&idx) = inner.map.get(&key) {
                if inner.node(idx).value.is_expired() {
                    let fresh = factory();
                    let old = std::mem::replace(&mut inner.node_mut(idx).value, fresh);
                    retired.push(old);
                }
                inner.unlink(idx);
                inner.push_front(idx);
                inner.node(idx).value.clone()
            } else {
                let value = factory();
                inner.insert_front(key, value.clone());
                if inner.map.len() > self.capacity {
                    if let Some(old) = inner.pop_tail() {
                        retired.push(old);
                    }
                }
                value
            }
        };
        // Finalizers run outside the critical section; they may take
        // other locks.
        for old in retired {
            old.finalize();
        }
        value
    }

    /// Drops every resident value, finalizing each one.
    pub fn clear(&self) {
        let retired = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            let values: Vec<V> = inner
                .nodes
                .drain(..)
                .flatten()
                .map(|node| node.value)
                .collect();
            inner.map.clear();
            inner.free.clear();
            inner.head = None;
            inner.tail = None;
            values
        };
        for old in retired {
            old.finalize();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone,
{
    fn node(&self, idx: usize) -> &Node<K, V> {
        self.nodes[idx].as_ref().expect("vacant lru slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.nodes[idx].as_mut().expect("vacant lru slot")
    }

    fn insert_front(&mut self, key: K, value: V) {
        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: usize) {
        self.node_mut(idx).prev = None;
        self.node_mut(idx).next = self.head;
        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.node_mut(idx).prev = None;
        self.node_mut(idx).next = None;
    }

    fn pop_tail(&mut self) -> Option<V> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("vacant lru slot");
        self.map.remove(&node.key);
        self.free.push(idx);
        Some(node.value)
    }
}
