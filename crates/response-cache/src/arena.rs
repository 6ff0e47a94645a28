use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Sentinel index meaning "no node".
pub const NIL: u32 = u32::MAX;

/// A cached value plus its list links and SIEVE visited bit.
pub struct Node<V> {
    pub key: String,
    pub value: Arc<V>,
    pub expires_at: Instant,
    pub visited: AtomicBool,
    pub prev: u32,
    pub next: u32,
}

impl<V> Node<V> {
    pub fn new(key: String, value: V, expires_at: Instant) -> Self {
        Self {
            key,
            value: Arc::new(value),
            expires_at,
            visited: AtomicBool::new(false),
            prev: NIL,
            next: NIL,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    #[inline]
    pub fn mark_visited(&self) {
        self.visited.store(true, Ordering::Relaxed);
    }

    /// Clear the visited bit, returning its previous value.
    #[inline]
    pub fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::Relaxed)
    }

    #[inline]
    pub fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity doubly-linked list backed by a `Vec`. `u32` indices act as pointers and
/// freed slots are recycled through a free list.
pub struct Arena<V> {
    slots: Vec<Option<Node<V>>>,
    free_list: Vec<u32>,
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl<V> Arena<V> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect();
        // Reversed so slot 0 is handed out first.
        let free_list = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free_list,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Node<V>> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    fn link_mut(&mut self, index: u32) -> Option<&mut Node<V>> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Insert `node` at the head. `None` when every slot is taken.
    pub fn push_head(&mut self, mut node: Node<V>) -> Option<u32> {
        let index = self.free_list.pop()?;
        node.prev = NIL;
        node.next = self.head;
        self.slots[index as usize] = Some(node);

        let old_head = self.head;
        if let Some(head) = self.link_mut(old_head) {
            head.prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
        self.len += 1;
        Some(index)
    }

    /// Unlink the node at `index` and reclaim its slot.
    pub fn remove(&mut self, index: u32) -> Option<Node<V>> {
        let node = self.slots.get_mut(index as usize)?.take()?;
        let (prev, next) = (node.prev, node.next);

        match self.link_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.link_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }

        self.free_list.push(index);
        self.len -= 1;
        Some(node)
    }
}
