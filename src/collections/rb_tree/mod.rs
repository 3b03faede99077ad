//! [`RBTree`], an ordered map kept balanced as a red-black tree.
//!
//! Keys are ordered by a [`Compare`] implementation chosen when the tree is created, so
//! the key type need not implement [`Ord`]. A tree may also be given release hooks, which
//! receive every key and value the tree discards ( on insert of an existing key, replace,
//! remove, clear and drop ). [`RBTree::steal`] removes an entry without running the hooks
//! and hands it to the caller instead.
//!
//! # Example
//!
//! ```
//!     use redblack::collections::RBTree;
//!     use std::ops::ControlFlow;
//!     let mut t = RBTree::new();
//!     for (k, v) in [(5, "a"), (3, "b"), (8, "c"), (1, "d"), (4, "e")] {
//!         t.insert(k, v);
//!     }
//!     t.remove(&3);
//!     let mut seen = Vec::new();
//!     let _ = t.traverse(|k, v| {
//!         seen.push((*k, *v));
//!         ControlFlow::Continue(())
//!     });
//!     assert_eq!(seen, [(1, "d"), (4, "e"), (5, "a"), (8, "c")]);
//! ```
//!
//! # Implementation
//!
//! Nodes are records in a single buffer addressed by index, with index 0 reserved for the
//! black sentinel standing in for every missing child or parent. Removed records go on a
//! free list and are reused by later inserts. The buffer itself comes from the tree's
//! [`Allocator`]; [`Pool`](crate::alloc::Pool) can be used to share released buffers between trees.

use std::{
    cmp::Ordering,
    error::Error,
    fmt,
    fmt::Debug,
    ops::{ControlFlow, Index},
};

use crate::alloc::{Allocator, Global};
use crate::collections::TryReserveError;

mod compare;
mod store;

pub use compare::{Compare, Natural, WithContext};
use store::{NodeId, NodeStore, INITIAL_SLOTS, NIL};

/// Hook receiving a discarded key or value.
pub type Release<T> = Box<dyn FnMut(T) + Send>;

struct Hooks<K, V> {
    key: Option<Release<K>>,
    value: Option<Release<V>>,
}

impl<K, V> Hooks<K, V> {
    #[inline]
    fn key(&mut self, k: K) {
        if let Some(f) = &mut self.key {
            f(k);
        }
    }

    #[inline]
    fn value(&mut self, v: V) {
        if let Some(f) = &mut self.value {
            f(v);
        }
    }
}

/// What happens to an existing entry when an equal key is inserted.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OnFound {
    /// Keep the stored key ( the new key is released ), swap in the new value.
    KeepKey,
    /// Swap in both the new key and the new value.
    ReplaceKey,
}

/// Ordered map implemented as a red-black tree.
///
/// `C` orders the keys ( see [`Compare`] ), `A` supplies node storage.
pub struct RBTree<K, V, C = Natural, A: Allocator = Global> {
    store: NodeStore<K, V, A>,
    cmp: C,
    hooks: Hooks<K, V>,
}

impl<K, V, C, A: Allocator> Drop for RBTree<K, V, C, A> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<K: Ord, V> Default for RBTree<K, V> {
    /// Creates an empty tree.
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> RBTree<K, V> {
    /// Returns a new, empty tree ordered by [`Ord`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(Natural)
    }
}

impl<K: Ord, V, A: Allocator> RBTree<K, V, Natural, A> {
    /// Returns a new, empty tree ordered by [`Ord`] storing nodes in `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Builder::new(Natural).build_in(alloc)
    }
}

impl<K, V, C: Compare<K>> RBTree<K, V, C> {
    /// Returns a new, empty tree ordered by `cmp`.
    ///
    /// # Example
    ///
    /// ```
    /// use redblack::collections::RBTree;
    /// let mut t = RBTree::with_comparator(|a: &i32, b: &i32| b.cmp(a));
    /// t.insert(1, ());
    /// t.insert(2, ());
    /// assert_eq!(t.first_key_value(), Some((&2, &())));
    /// ```
    pub fn with_comparator(cmp: C) -> Self {
        Builder::new(cmp).build()
    }

    /// Start configuring a tree ordered by `cmp`.
    pub fn builder(cmp: C) -> Builder<K, V, C> {
        Builder::new(cmp)
    }
}

impl<K, V, F, X> RBTree<K, V, WithContext<F, X>>
where
    F: Fn(&K, &K, &X) -> Ordering,
{
    /// Returns a new, empty tree ordered by `f`, which is passed `context` on every comparison.
    pub fn with_context(f: F, context: X) -> Self {
        Self::with_comparator(WithContext::new(f, context))
    }
}

/// Configuration for a new [`RBTree`].
///
/// # Example
///
/// ```
/// use redblack::collections::{rb_tree::Natural, RBTree};
/// use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
/// let released = Arc::new(AtomicUsize::new(0));
/// let r = released.clone();
/// let mut t = RBTree::builder(Natural)
///     .value_release(move |_v: String| {
///         r.fetch_add(1, Ordering::Relaxed);
///     })
///     .capacity(100)
///     .build();
/// t.insert(1, "x".to_string());
/// t.insert(1, "y".to_string());
/// assert_eq!(released.load(Ordering::Relaxed), 1);
/// ```
pub struct Builder<K, V, C> {
    cmp: C,
    capacity: usize,
    hooks: Hooks<K, V>,
}

impl<K, V, C> Builder<K, V, C> {
    fn new(cmp: C) -> Self {
        Self {
            cmp,
            capacity: INITIAL_SLOTS - 1,
            hooks: Hooks {
                key: None,
                value: None,
            },
        }
    }

    /// Called with every key the tree discards.
    pub fn key_release<F>(mut self, f: F) -> Self
    where
        F: FnMut(K) + Send + 'static,
    {
        self.hooks.key = Some(Box::new(f));
        self
    }

    /// Called with every value the tree discards.
    pub fn value_release<F>(mut self, f: F) -> Self
    where
        F: FnMut(V) + Send + 'static,
    {
        self.hooks.value = Some(Box::new(f));
        self
    }

    /// Number of entries the tree can hold before its node storage first grows.
    pub fn capacity(mut self, n: usize) -> Self {
        self.capacity = n;
        self
    }

    /// Create the tree using the global allocator.
    pub fn build(self) -> RBTree<K, V, C> {
        self.build_in(Global)
    }

    /// Create the tree storing nodes in `alloc`.
    pub fn build_in<A: Allocator>(self, alloc: A) -> RBTree<K, V, C, A> {
        RBTree {
            store: NodeStore::with_slots_in(self.capacity.saturating_add(1), alloc),
            cmp: self.cmp,
            hooks: self.hooks,
        }
    }
}

/// Result of walking down from the root looking for a key.
struct Search {
    /// Matching node, or NIL.
    found: NodeId,
    /// Last real node visited, the parent for an insert.
    parent: NodeId,
    /// How the key compared with `parent`.
    last: Ordering,
}

impl<K, V, C, A: Allocator> RBTree<K, V, C, A> {
    /// Get number of key-value pairs in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.live()
    }

    /// Is the tree empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.root == NIL
    }

    /// Count the entries by walking the whole tree. Always equal to [`len`](Self::len).
    #[must_use]
    pub fn size(&self) -> usize {
        self.store.count()
    }

    /// Number of levels from the root to the deepest entry, 0 for an empty tree.
    ///
    /// Never more than `2 * log2(len + 1)`.
    #[must_use]
    pub fn height(&self) -> usize {
        self.store.height()
    }

    /// The comparator ordering this tree.
    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// The allocator supplying node storage.
    pub fn allocator(&self) -> &A {
        self.store.allocator()
    }

    /// Remove every entry, passing keys and values to the release hooks.
    pub fn clear(&mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        if self.store.root == NIL {
            return;
        }
        debug_log!(entries = self.store.live(), "releasing tree");
        let hooks = &mut self.hooks;
        self.store.drain_post_order(|k, v| {
            hooks.key(k);
            hooks.value(v);
        });
    }

    /// Reserve node storage for at least `additional` more entries.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.store.try_reserve(additional)
    }

    /// Visit every entry in key order. Returning `ControlFlow::Break` from `visit` stops the walk
    /// and is passed back to the caller.
    ///
    /// # Example
    ///
    /// ```
    /// use redblack::collections::RBTree;
    /// use std::ops::ControlFlow;
    /// let t: RBTree<_, _> = (0..10).map(|i| (i, i * i)).collect();
    /// let mut seen = 0;
    /// let flow = t.traverse(|k, _| {
    ///     seen += 1;
    ///     if *k == 3 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
    /// });
    /// assert!(flow.is_break());
    /// assert_eq!(seen, 4);
    /// ```
    pub fn traverse<F>(&self, mut visit: F) -> ControlFlow<()>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        self.store.walk_in_order(|n| {
            let (k, v) = self.store.entry(n);
            visit(k, v)
        })
    }

    /// Returns the first key-value pair in the tree.
    pub fn first_key_value(&self) -> Option<(&K, &V)> {
        match self.store.root {
            NIL => None,
            root => Some(self.store.entry(self.store.minimum(root))),
        }
    }

    /// Returns the last key-value pair in the tree.
    pub fn last_key_value(&self) -> Option<(&K, &V)> {
        match self.store.root {
            NIL => None,
            root => Some(self.store.entry(self.store.maximum(root))),
        }
    }

    /// Check every red-black invariant, returning the black-height of the root.
    ///
    /// A correct tree always passes, this exists for tests and for callers whose
    /// comparator might not be a total order.
    pub fn check_invariants(&self) -> Result<usize, InvariantError>
    where
        C: Compare<K>,
    {
        self.store
            .verify(|a, b| self.cmp.compare(a, b) == Ordering::Less)
    }
}

impl<K, V, C: Compare<K>, A: Allocator> RBTree<K, V, C, A> {
    fn search(&self, key: &K) -> Search {
        let mut s = Search {
            found: NIL,
            parent: NIL,
            last: Ordering::Equal,
        };
        let mut x = self.store.root;
        while x != NIL {
            s.parent = x;
            s.last = self.cmp.compare(key, self.store.key(x));
            x = match s.last {
                Ordering::Less => self.store.left(x),
                Ordering::Greater => self.store.right(x),
                Ordering::Equal => {
                    s.found = x;
                    break;
                }
            };
        }
        s
    }

    fn find(&self, key: &K) -> NodeId {
        self.search(key).found
    }

    fn insert_with(&mut self, key: K, value: V, on_found: OnFound) {
        let s = self.search(&key);
        if s.found != NIL {
            let (k, v) = self.store.entry_mut(s.found);
            let old_value = std::mem::replace(v, value);
            let discarded_key = match on_found {
                OnFound::KeepKey => key,
                OnFound::ReplaceKey => std::mem::replace(k, key),
            };
            self.hooks.key(discarded_key);
            self.hooks.value(old_value);
            return;
        }
        let z = self.store.acquire(key, value, s.parent);
        self.store.attach(z, s.parent, s.last == Ordering::Less);
    }

    /// Insert a key-value pair into the tree.
    ///
    /// If an equal key is already present only its value is updated: the old value and the
    /// passed `key` go to the release hooks, the stored key is kept.
    pub fn insert(&mut self, key: K, value: V) {
        self.insert_with(key, value, OnFound::KeepKey);
    }

    /// Like [`insert`](Self::insert), except that when an equal key is present both the stored
    /// key and value are replaced, and the old ones go to the release hooks.
    ///
    /// # Example
    ///
    /// ```
    /// use redblack::collections::RBTree;
    /// // Only the number takes part in ordering.
    /// let mut t = RBTree::with_comparator(|a: &(i32, char), b: &(i32, char)| a.0.cmp(&b.0));
    /// t.insert((1, 'x'), "first");
    /// t.insert((1, 'y'), "second");
    /// assert_eq!(t.lookup_extended(&(1, ' ')), Some((&(1, 'x'), &"second")));
    /// t.replace((1, 'z'), "third");
    /// assert_eq!(t.lookup_extended(&(1, ' ')), Some((&(1, 'z'), &"third")));
    /// ```
    pub fn replace(&mut self, key: K, value: V) {
        self.insert_with(key, value, OnFound::ReplaceKey);
    }

    /// Returns a reference to the value stored for `key`.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.lookup_extended(key).map(|(_, v)| v)
    }

    /// Returns a mutable reference to the value stored for `key`.
    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.find(key) {
            NIL => None,
            n => Some(&mut self.store.entry_mut(n).1),
        }
    }

    /// Returns the stored key equal to `key` together with its value.
    pub fn lookup_extended(&self, key: &K) -> Option<(&K, &V)> {
        match self.find(key) {
            NIL => None,
            n => Some(self.store.entry(n)),
        }
    }

    /// Does the tree contain `key`?
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key) != NIL
    }

    /// Remove the entry for `key`, passing its key and value to the release hooks.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.find(key) {
            NIL => false,
            n => {
                let (k, v) = self.store.remove(n);
                self.hooks.key(k);
                self.hooks.value(v);
                true
            }
        }
    }

    /// Remove the entry for `key` without running the release hooks, returning it to the caller.
    pub fn steal(&mut self, key: &K) -> Option<(K, V)> {
        match self.find(key) {
            NIL => None,
            n => Some(self.store.remove(n)),
        }
    }
}

impl<K: Debug, V: Debug, C, A: Allocator> Debug for RBTree<K, V, C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        let _ = self.traverse(|k, v| {
            m.entry(k, v);
            ControlFlow::Continue(())
        });
        m.finish()
    }
}

impl<K, V, C: Compare<K>, A: Allocator> Extend<(K, V)> for RBTree<K, V, C, A> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for RBTree<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut t = Self::new();
        t.extend(iter);
        t
    }
}

impl<K: Ord, V, const N: usize> From<[(K, V); N]> for RBTree<K, V> {
    fn from(arr: [(K, V); N]) -> Self {
        let mut t = Builder::new(Natural).capacity(N).build();
        t.extend(arr);
        t
    }
}

impl<K, V, C: Compare<K>, A: Allocator> Index<&K> for RBTree<K, V, C, A> {
    type Output = V;

    /// Returns a reference to the value for `key`.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the tree.
    #[inline]
    fn index(&self, key: &K) -> &V {
        self.lookup(key).expect("no entry found for key")
    }
}

/// A red-black invariant found broken by [`RBTree::check_invariants`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantError {
    /// The sentinel was recoloured red or given an entry.
    SentinelModified,
    /// The root is red.
    RedRoot,
    /// A red node has a red child.
    RedRedEdge,
    /// Two sibling subtrees have different black-heights.
    BlackHeightMismatch {
        /// Black-height of the left subtree.
        left: usize,
        /// Black-height of the right subtree.
        right: usize,
    },
    /// A child's parent link does not point back at its parent.
    BrokenParentLink,
    /// A key is not between the keys bounding its subtree.
    OutOfOrder,
    /// A node on the free list is still linked into the tree.
    VacantLinked,
    /// The tree is deeper than any balanced tree can be.
    TooDeep,
    /// The number of reachable nodes differs from the number of stored entries.
    CountMismatch {
        /// Nodes reachable from the root.
        counted: usize,
        /// Entries the store believes are live.
        live: usize,
    },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SentinelModified => f.write_str("sentinel node was modified"),
            Self::RedRoot => f.write_str("root is red"),
            Self::RedRedEdge => f.write_str("red node has a red child"),
            Self::BlackHeightMismatch { left, right } => {
                write!(f, "black-height mismatch: left {left}, right {right}")
            }
            Self::BrokenParentLink => f.write_str("parent link does not match child link"),
            Self::OutOfOrder => f.write_str("keys out of order"),
            Self::VacantLinked => f.write_str("vacant node linked into tree"),
            Self::TooDeep => f.write_str("tree exceeds maximum red-black height"),
            Self::CountMismatch { counted, live } => {
                write!(f, "{counted} nodes reachable but {live} entries stored")
            }
        }
    }
}

impl Error for InvariantError {}

#[cfg(all(test, not(miri), feature = "cap"))]
#[global_allocator]
static ALLOCATOR: cap::Cap<std::alloc::System> =
    cap::Cap::new(std::alloc::System, usize::MAX);

#[cfg(test)]
fn print_memory() {
    #[cfg(all(test, not(miri), feature = "cap"))]
    println!("Memory allocated: {} bytes", ALLOCATOR.allocated());
}

/* mimalloc cannot be used with miri */
#[cfg(all(test, not(miri), not(feature = "cap")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(test)]
mod mytests;
