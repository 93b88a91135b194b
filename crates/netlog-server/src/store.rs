//! Insert-only lock-free chain used as the endpoint store.
//!
//! Writers publish new nodes at the head with a compare-and-swap retry loop.
//! Readers load the head once and walk `next` links without synchronization.
//! Nodes are never unlinked while the chain is shared, so no reclamation
//! scheme is needed; everything is freed when the chain itself is dropped.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    // Written once before publication, immutable afterwards.
    next: *mut Node<T>,
}

/// Result of [`AtomicChain::push_if_absent`].
#[derive(Debug)]
pub enum Claim<'a, T> {
    /// The value was published and is now the head of the chain.
    Inserted(&'a T),
    /// A matching value was already present; the candidate was dropped.
    Existing(&'a T),
}

impl<'a, T> Claim<'a, T> {
    pub fn get(&self) -> &'a T {
        match *self {
            Claim::Inserted(v) | Claim::Existing(v) => v,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Claim::Inserted(_))
    }
}

/// A singly linked, append-to-front, never-shrinking chain.
pub struct AtomicChain<T> {
    head: AtomicPtr<Node<T>>,
    _owns: PhantomData<Box<Node<T>>>,
}

// Safety: nodes are only reachable through `&T` once published and are freed
// exclusively in `Drop`, which requires unique access.
unsafe impl<T: Send> Send for AtomicChain<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicChain<T> {}

impl<T> Default for AtomicChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AtomicChain<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Publish `value` at the front of the chain. Lock-free: retries only when
    /// another writer won the race for the head.
    pub fn push(&self, value: T) -> &T {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: `node` is not yet shared.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                // Safety: published nodes live as long as `self`.
                Ok(_) => return unsafe { &(*node).value },
                Err(current) => head = current,
            }
        }
    }

    /// Publish `value` unless a node matching `matches` is already reachable.
    ///
    /// Because nodes only ever appear at the front, a failed CAS only requires
    /// re-checking the nodes pushed since the previous attempt. Two racing
    /// callers with equivalent values therefore cannot both insert.
    pub fn push_if_absent<F>(&self, value: T, mut matches: F) -> Claim<'_, T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut head = self.head.load(Ordering::Acquire);
        if let Some(existing) = Self::find_between(head, ptr::null_mut(), &mut matches) {
            return Claim::Existing(existing);
        }

        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Claim::Inserted(unsafe { &(*node).value }),
                Err(current) => {
                    if let Some(existing) = Self::find_between(current, head, &mut matches) {
                        // Safety: `node` was never published.
                        drop(unsafe { Box::from_raw(node) });
                        return Claim::Existing(existing);
                    }
                    head = current;
                }
            }
        }
    }

    /// First value in chain order (newest first) satisfying `predicate`.
    /// Wait-free with respect to concurrent pushes.
    pub fn find<F>(&self, mut predicate: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        Self::find_between(self.head.load(Ordering::Acquire), ptr::null_mut(), &mut predicate)
    }

    /// Number of published values. Diagnostic only: the result may be stale
    /// as soon as it is returned.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Snapshot iterator starting at the current head.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head.load(Ordering::Acquire),
            _chain: PhantomData,
        }
    }

    fn find_between<'a, F>(
        from: *mut Node<T>,
        until: *mut Node<T>,
        predicate: &mut F,
    ) -> Option<&'a T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut current = from;
        while !current.is_null() && current != until {
            // Safety: reachable nodes are published and never freed while shared.
            let node = unsafe { &*current };
            if predicate(&node.value) {
                return Some(&node.value);
            }
            current = node.next;
        }
        None
    }
}

impl<T> Drop for AtomicChain<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // Safety: `&mut self` guarantees no outstanding readers.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
    }
}

pub struct Iter<'a, T> {
    current: *mut Node<T>,
    _chain: PhantomData<&'a AtomicChain<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.current.is_null() {
            return None;
        }
        // Safety: the iterator borrows the chain, which outlives every node.
        let node = unsafe { &*self.current };
        self.current = node.next;
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_is_newest_first() {
        let chain = AtomicChain::new();
        assert!(chain.is_empty());
        chain.push(1);
        chain.push(2);
        chain.push(3);
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_find_returns_newest_duplicate() {
        let chain = AtomicChain::new();
        chain.push(("a", 1));
        chain.push(("b", 2));
        chain.push(("a", 3));
        assert_eq!(chain.find(|(k, _)| *k == "a"), Some(&("a", 3)));
        assert_eq!(chain.find(|(k, _)| *k == "b"), Some(&("b", 2)));
        assert_eq!(chain.find(|(k, _)| *k == "c"), None);
    }

    #[test]
    fn test_push_returns_stable_reference() {
        let chain = AtomicChain::new();
        let first = chain.push(String::from("first")) as *const String;
        for i in 0..100 {
            chain.push(i.to_string());
        }
        let found = chain.find(|s| s == "first").unwrap() as *const String;
        assert_eq!(first, found);
    }

    #[test]
    fn test_push_if_absent() {
        let chain = AtomicChain::new();
        assert!(chain.push_if_absent(7, |v| *v == 7).is_inserted());
        let again = chain.push_if_absent(7, |v| *v == 7);
        assert!(!again.is_inserted());
        assert_eq!(*again.get(), 7);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_concurrent_push_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let chain = Arc::new(AtomicChain::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let chain = Arc::clone(&chain);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        chain.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(chain.len(), THREADS * PER_THREAD);
        let mut all: Vec<_> = chain.iter().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_readers_see_consistent_values() {
        let chain = Arc::new(AtomicChain::new());
        let writer = {
            let chain = Arc::clone(&chain);
            thread::spawn(move || {
                for i in 0..5_000u64 {
                    chain.push((i, i * 3));
                }
            })
        };
        let reader = {
            let chain = Arc::clone(&chain);
            thread::spawn(move || {
                for _ in 0..200 {
                    for (k, v) in chain.iter() {
                        assert_eq!(*v, k * 3);
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        for key in [0u64, 2_500, 4_999] {
            assert_eq!(chain.find(|(k, _)| *k == key), Some(&(key, key * 3)));
        }
    }

    #[test]
    fn test_concurrent_push_if_absent_single_winner() {
        const THREADS: usize = 16;

        for _ in 0..50 {
            let chain = Arc::new(AtomicChain::new());
            let barrier = Arc::new(std::sync::Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let chain = Arc::clone(&chain);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        // Unrelated pushes interleave with the contested key
                        chain.push(("other", t));
                        chain.push_if_absent(("key", t), |(k, _)| *k == "key").is_inserted()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(chain.iter().filter(|(k, _)| *k == "key").count(), 1);
            assert_eq!(chain.len(), THREADS + 1);
        }
    }
}
