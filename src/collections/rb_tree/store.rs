//! Node storage and the structural half of the red-black algorithms.
//!
//! Nodes live in one buffer obtained from an [`Allocator`] and refer to each other by index.
//! Index [`NIL`] is the sentinel: a black record whose links point at itself and which never
//! holds an entry. Every "no child" or "no parent" link is `NIL`, so colour and parent reads
//! never need a null check.
//!
//! Nothing in here compares keys, the tree module does the searching and this module
//! does the linking, rotating and recolouring.

use std::{alloc::Layout, mem, ops::ControlFlow, ptr, ptr::NonNull};

use arrayvec::ArrayVec;

use super::InvariantError;
use crate::alloc::Allocator;
use crate::collections::{TryReserveError, TryReserveErrorKind};

/// Index of a node record.
pub(crate) type NodeId = usize;

/// The sentinel.
pub(crate) const NIL: NodeId = 0;

/// Upper bound on the height of any tree that fits in an addressable buffer ( 2 * log2(n+1) ).
pub(crate) const MAX_HEIGHT: usize = 2 * usize::BITS as usize;

/// Explicit stack used by walks. Pre/post-order walks hold at most two entries per level.
type Stack<T> = ArrayVec<T, { 2 * MAX_HEIGHT + 2 }>;

/// Slots allocated when a store is created, including the sentinel.
pub(crate) const INITIAL_SLOTS: usize = 8;

/// In debug mode or feature unsafe-optim not enabled, same as assert! otherwise does nothing.
#[cfg(any(debug_assertions, not(feature = "unsafe-optim")))]
macro_rules! safe_assert {
    ( $cond: expr ) => {
        assert!($cond)
    };
}

/// In debug mode or feature unsafe-optim not enabled, same as assert! otherwise does nothing.
#[cfg(all(not(debug_assertions), feature = "unsafe-optim"))]
macro_rules! safe_assert {
    ( $cond: expr ) => {
        if !$cond {
            unsafe { std::hint::unreachable_unchecked() }
        }
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Color {
    Red,
    Black,
}

/// One node record. A vacant record ( on the free list ) keeps the next free index in `left`.
pub(crate) struct Node<K, V> {
    left: NodeId,
    right: NodeId,
    parent: NodeId,
    color: Color,
    entry: Option<(K, V)>,
}

impl<K, V> Node<K, V> {
    const fn vacant(next_free: NodeId) -> Self {
        Self {
            left: next_free,
            right: NIL,
            parent: NIL,
            color: Color::Black,
            entry: None,
        }
    }
}

pub(crate) struct NodeStore<K, V, A: Allocator> {
    p: NonNull<Node<K, V>>,
    /// Slots allocated.
    cap: usize,
    /// Slots written so far ( sentinel included ), every slot below this is initialised.
    used: usize,
    /// Head of the free list.
    free: NodeId,
    /// Nodes holding an entry.
    live: usize,
    pub(crate) root: NodeId,
    alloc: A,
}

unsafe impl<K: Send, V: Send, A: Allocator + Send> Send for NodeStore<K, V, A> {}
unsafe impl<K: Sync, V: Sync, A: Allocator + Sync> Sync for NodeStore<K, V, A> {}

impl<K, V, A: Allocator> Drop for NodeStore<K, V, A> {
    fn drop(&mut self) {
        unsafe {
            for i in 0..self.used {
                ptr::drop_in_place(self.p.as_ptr().add(i));
            }
            let layout = Layout::array::<Node<K, V>>(self.cap).unwrap_unchecked();
            self.alloc.deallocate(self.p.cast(), layout);
        }
    }
}

fn reserve_failed(e: TryReserveError) -> ! {
    match e.kind {
        TryReserveErrorKind::CapacityOverflow => panic!("node capacity overflow"),
        TryReserveErrorKind::AllocError { layout } => std::alloc::handle_alloc_error(layout),
    }
}

/// # Storage.
impl<K, V, A: Allocator> NodeStore<K, V, A> {
    /// New store with room for `slots` records ( sentinel included, never fewer than two ).
    pub(crate) fn with_slots_in(slots: usize, alloc: A) -> Self {
        let cap = slots.max(2);
        let layout = match Layout::array::<Node<K, V>>(cap) {
            Ok(layout) => layout,
            Err(_) => reserve_failed(TryReserveError {
                kind: TryReserveErrorKind::CapacityOverflow,
            }),
        };
        let p = match alloc.allocate(layout) {
            Ok(p) => p.cast::<Node<K, V>>(),
            Err(_) => std::alloc::handle_alloc_error(layout),
        };
        unsafe { ptr::write(p.as_ptr(), Node::vacant(NIL)) };
        Self {
            p,
            cap,
            used: 1,
            free: NIL,
            live: 0,
            root: NIL,
            alloc,
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Make sure `additional` more nodes can be acquired without allocating.
    pub(crate) fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let vacant = self.used - 1 - self.live;
        let fresh = additional.saturating_sub(vacant);
        let required = self
            .used
            .checked_add(fresh)
            .ok_or(TryReserveError {
                kind: TryReserveErrorKind::CapacityOverflow,
            })?;
        if required > self.cap {
            self.grow(required)?;
        }
        Ok(())
    }

    fn grow(&mut self, min_cap: usize) -> Result<(), TryReserveError> {
        let new_cap = min_cap.max(self.cap.saturating_mul(2));
        let overflow = TryReserveError {
            kind: TryReserveErrorKind::CapacityOverflow,
        };
        let new_layout = Layout::array::<Node<K, V>>(new_cap).map_err(|_| overflow)?;
        let old_layout = unsafe { Layout::array::<Node<K, V>>(self.cap).unwrap_unchecked() };
        let p = unsafe { self.alloc.grow(self.p.cast(), old_layout, new_layout) }.map_err(
            |_| TryReserveError {
                kind: TryReserveErrorKind::AllocError { layout: new_layout },
            },
        )?;
        debug_log!(from = self.cap, to = new_cap, "node store grown");
        self.p = p.cast();
        self.cap = new_cap;
        Ok(())
    }

    #[inline]
    fn node(&self, i: NodeId) -> &Node<K, V> {
        safe_assert!(i < self.used);
        unsafe { &*self.p.as_ptr().add(i) }
    }

    #[inline]
    fn node_mut(&mut self, i: NodeId) -> &mut Node<K, V> {
        safe_assert!(i < self.used);
        unsafe { &mut *self.p.as_ptr().add(i) }
    }

    /// Take a record ( recycled first, fresh otherwise ) and fill it as a red leaf under `parent`.
    pub(crate) fn acquire(&mut self, key: K, value: V, parent: NodeId) -> NodeId {
        let node = Node {
            left: NIL,
            right: NIL,
            parent,
            color: Color::Red,
            entry: Some((key, value)),
        };
        let id = if self.free != NIL {
            let id = self.free;
            self.free = self.node(id).left;
            *self.node_mut(id) = node;
            id
        } else {
            if self.used == self.cap {
                if let Err(e) = self.grow(self.cap + 1) {
                    reserve_failed(e);
                }
            }
            unsafe { ptr::write(self.p.as_ptr().add(self.used), node) };
            self.used += 1;
            self.used - 1
        };
        self.live += 1;
        id
    }

    /// Put an unlinked record on the free list, handing back its entry.
    fn release(&mut self, id: NodeId) -> (K, V) {
        let next = self.free;
        let old = mem::replace(self.node_mut(id), Node::vacant(next));
        self.free = id;
        self.live -= 1;
        match old.entry {
            Some(kv) => kv,
            None => unreachable!("released a vacant node"),
        }
    }
}

/// # Field access.
impl<K, V, A: Allocator> NodeStore<K, V, A> {
    #[inline]
    pub(crate) fn left(&self, i: NodeId) -> NodeId {
        self.node(i).left
    }

    #[inline]
    pub(crate) fn right(&self, i: NodeId) -> NodeId {
        self.node(i).right
    }

    #[inline]
    pub(crate) fn parent(&self, i: NodeId) -> NodeId {
        self.node(i).parent
    }

    #[inline]
    fn color(&self, i: NodeId) -> Color {
        self.node(i).color
    }

    #[inline]
    fn is_red(&self, i: NodeId) -> bool {
        self.node(i).color == Color::Red
    }

    #[inline]
    fn set_left(&mut self, i: NodeId, to: NodeId) {
        self.node_mut(i).left = to;
    }

    #[inline]
    fn set_right(&mut self, i: NodeId, to: NodeId) {
        self.node_mut(i).right = to;
    }

    #[inline]
    fn set_parent(&mut self, i: NodeId, to: NodeId) {
        self.node_mut(i).parent = to;
    }

    #[inline]
    fn set_color(&mut self, i: NodeId, c: Color) {
        self.node_mut(i).color = c;
    }

    #[inline]
    pub(crate) fn entry(&self, i: NodeId) -> (&K, &V) {
        match &self.node(i).entry {
            Some((k, v)) => (k, v),
            None => unreachable!("node {i} holds no entry"),
        }
    }

    #[inline]
    pub(crate) fn key(&self, i: NodeId) -> &K {
        self.entry(i).0
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, i: NodeId) -> &mut (K, V) {
        match &mut self.node_mut(i).entry {
            Some(kv) => kv,
            None => unreachable!("node {i} holds no entry"),
        }
    }
}

/// # Rotation and rebalancing.
impl<K, V, A: Allocator> NodeStore<K, V, A> {
    /// Point whichever link of `parent` referred to `old` at `new` ( the root when `parent` is NIL ).
    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if parent == NIL {
            self.root = new;
        } else if self.left(parent) == old {
            self.set_left(parent, new);
        } else {
            self.set_right(parent, new);
        }
    }

    /// ```text
    ///         x    -> rotate_left(x) ->        y
    ///       /   \                            /   \
    ///      a     y  <- rotate_right(y) <-   x     c
    ///          /   \                      /   \
    ///         b     c                    a     b
    /// ```
    fn rotate_left(&mut self, x: NodeId) {
        let y = self.right(x);
        safe_assert!(x != NIL && y != NIL);
        trace_log!(x, y, "rotate left");

        let b = self.left(y);
        self.set_right(x, b);
        if b != NIL {
            self.set_parent(b, x);
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        self.replace_child(xp, x, y);
        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, y: NodeId) {
        let x = self.left(y);
        safe_assert!(y != NIL && x != NIL);
        trace_log!(x, y, "rotate right");

        let b = self.right(x);
        self.set_left(y, b);
        if b != NIL {
            self.set_parent(b, y);
        }
        let yp = self.parent(y);
        self.set_parent(x, yp);
        self.replace_child(yp, y, x);
        self.set_right(x, y);
        self.set_parent(y, x);
    }

    /// Link a freshly acquired red node `z` below `parent` and restore the colour invariants.
    pub(crate) fn attach(&mut self, z: NodeId, parent: NodeId, as_left: bool) {
        if parent == NIL {
            self.root = z;
        } else if as_left {
            self.set_left(parent, z);
        } else {
            self.set_right(parent, z);
        }
        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while z != self.root && self.is_red(self.parent(z)) {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.is_red(uncle) {
                    trace_log!(z, g, "recolour past red uncle");
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.is_red(uncle) {
                    trace_log!(z, g, "recolour past red uncle");
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    pub(crate) fn minimum(&self, mut x: NodeId) -> NodeId {
        while self.left(x) != NIL {
            x = self.left(x);
        }
        x
    }

    pub(crate) fn maximum(&self, mut x: NodeId) -> NodeId {
        while self.right(x) != NIL {
            x = self.right(x);
        }
        x
    }

    /// Next node in key order, NIL if `x` holds the greatest key.
    pub(crate) fn successor(&self, mut x: NodeId) -> NodeId {
        if self.right(x) != NIL {
            return self.minimum(self.right(x));
        }
        let mut y = self.parent(x);
        while y != NIL && x == self.right(y) {
            x = y;
            y = self.parent(y);
        }
        y
    }

    /// Unlink the entry held by `z` and return it.
    ///
    /// When `z` has two children the record actually spliced out is its successor, whose
    /// entry is first moved into `z`.
    pub(crate) fn remove(&mut self, z: NodeId) -> (K, V) {
        let y = if self.left(z) == NIL || self.right(z) == NIL {
            z
        } else {
            self.successor(z)
        };
        let x = if self.left(y) != NIL {
            self.left(y)
        } else {
            self.right(y)
        };

        // Also done when x is NIL, the fixup walks up from there.
        let yp = self.parent(y);
        self.set_parent(x, yp);
        self.replace_child(yp, y, x);

        if y != z {
            let moved = self.node_mut(y).entry.take();
            let removed = mem::replace(&mut self.node_mut(z).entry, moved);
            self.node_mut(y).entry = removed;
        }

        if self.color(y) == Color::Black {
            self.delete_fixup(x);
        }
        self.release(y)
    }

    fn delete_fixup(&mut self, mut x: NodeId) {
        while x != self.root && !self.is_red(x) {
            let p = self.parent(x);
            if x == self.left(p) {
                let mut w = self.right(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.right(p);
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    trace_log!(x, p, "push double black up");
                    self.set_color(w, Color::Red);
                    x = p;
                } else {
                    if !self.is_red(self.right(w)) {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(p);
                    }
                    self.set_color(w, self.color(p));
                    self.set_color(p, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.left(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.left(p);
                }
                if !self.is_red(self.right(w)) && !self.is_red(self.left(w)) {
                    trace_log!(x, p, "push double black up");
                    self.set_color(w, Color::Red);
                    x = p;
                } else {
                    if !self.is_red(self.left(w)) {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(p);
                    }
                    self.set_color(w, self.color(p));
                    self.set_color(p, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }
}

/// # Walks.
///
/// All walks use a bounded explicit stack, a balanced tree never needs more than [`MAX_HEIGHT`] levels.
impl<K, V, A: Allocator> NodeStore<K, V, A> {
    /// Visit nodes in key order until `f` breaks.
    pub(crate) fn walk_in_order<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(NodeId) -> ControlFlow<()>,
    {
        let mut stack = Stack::<NodeId>::new();
        let mut cur = self.root;
        loop {
            while cur != NIL {
                stack.push(cur);
                cur = self.left(cur);
            }
            match stack.pop() {
                Some(n) => {
                    f(n)?;
                    cur = self.right(n);
                }
                None => return ControlFlow::Continue(()),
            }
        }
    }

    /// Number of nodes reachable from the root.
    pub(crate) fn count(&self) -> usize {
        let mut stack = Stack::<NodeId>::new();
        let mut n = 0;
        if self.root != NIL {
            stack.push(self.root);
        }
        while let Some(x) = stack.pop() {
            n += 1;
            for c in [self.left(x), self.right(x)] {
                if c != NIL {
                    stack.push(c);
                }
            }
        }
        n
    }

    /// Levels from the root to the deepest node, 0 when empty.
    pub(crate) fn height(&self) -> usize {
        let mut stack = Stack::<(NodeId, usize)>::new();
        let mut max = 0;
        if self.root != NIL {
            stack.push((self.root, 1));
        }
        while let Some((x, depth)) = stack.pop() {
            max = max.max(depth);
            for c in [self.left(x), self.right(x)] {
                if c != NIL {
                    stack.push((c, depth + 1));
                }
            }
        }
        max
    }

    /// Unlink every node, passing entries to `f` in post-order ( right, left, node ).
    ///
    /// The tree is empty before the first call to `f`, so a panicking `f` only leaks entries
    /// into vacant-but-unlisted records, which are still dropped with the store.
    pub(crate) fn drain_post_order<F>(&mut self, mut f: F)
    where
        F: FnMut(K, V),
    {
        let root = mem::replace(&mut self.root, NIL);
        let mut stack = Stack::<(NodeId, bool)>::new();
        if root != NIL {
            stack.push((root, false));
        }
        while let Some((x, expanded)) = stack.pop() {
            if expanded {
                let (k, v) = self.release(x);
                f(k, v);
            } else {
                stack.push((x, true));
                let (l, r) = (self.left(x), self.right(x));
                if l != NIL {
                    stack.push((l, false));
                }
                if r != NIL {
                    stack.push((r, false));
                }
            }
        }
    }
}

/// # Verification.
impl<K, V, A: Allocator> NodeStore<K, V, A> {
    /// Check colour, balance, linkage and ordering, returning the black-height of the root.
    pub(crate) fn verify<F>(&self, less: F) -> Result<usize, InvariantError>
    where
        F: Fn(&K, &K) -> bool,
    {
        let nil = self.node(NIL);
        if nil.color != Color::Black || nil.entry.is_some() {
            return Err(InvariantError::SentinelModified);
        }
        if self.root == NIL {
            return Ok(0);
        }
        if self.is_red(self.root) {
            return Err(InvariantError::RedRoot);
        }
        if self.parent(self.root) != NIL {
            return Err(InvariantError::BrokenParentLink);
        }
        let bh = self.verify_node(self.root, None, None, 1, &less)?;
        let counted = self.count();
        if counted != self.live {
            return Err(InvariantError::CountMismatch {
                counted,
                live: self.live,
            });
        }
        Ok(bh)
    }

    fn verify_node<F>(
        &self,
        x: NodeId,
        lo: Option<NodeId>,
        hi: Option<NodeId>,
        depth: usize,
        less: &F,
    ) -> Result<usize, InvariantError>
    where
        F: Fn(&K, &K) -> bool,
    {
        if x == NIL {
            return Ok(0);
        }
        if depth > MAX_HEIGHT {
            return Err(InvariantError::TooDeep);
        }
        if self.node(x).entry.is_none() {
            return Err(InvariantError::VacantLinked);
        }
        let key = self.key(x);
        if lo.is_some_and(|lo| !less(self.key(lo), key)) || hi.is_some_and(|hi| !less(key, self.key(hi))) {
            return Err(InvariantError::OutOfOrder);
        }
        let (l, r) = (self.left(x), self.right(x));
        for c in [l, r] {
            if c != NIL {
                if self.parent(c) != x {
                    return Err(InvariantError::BrokenParentLink);
                }
                if self.is_red(x) && self.is_red(c) {
                    return Err(InvariantError::RedRedEdge);
                }
            }
        }
        let lh = self.verify_node(l, lo, Some(x), depth + 1, less)?;
        let rh = self.verify_node(r, Some(x), hi, depth + 1, less)?;
        if lh != rh {
            return Err(InvariantError::BlackHeightMismatch { left: lh, right: rh });
        }
        Ok(lh + usize::from(!self.is_red(x)))
    }
}
