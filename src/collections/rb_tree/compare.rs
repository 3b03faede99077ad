use std::cmp::Ordering;

/// Three-way key comparison used to order an [`RBTree`](super::RBTree).
///
/// The ordering must be a strict total order; keys comparing `Equal` are treated as the same key.
pub trait Compare<K> {
    /// Compare `a` with `b`.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Natural;

impl<K: Ord> Compare<K> for Natural {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F> Compare<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// Comparator that is passed an auxiliary context value on every call.
///
/// # Example
///
/// ```
/// use redblack::collections::rb_tree::WithContext;
/// use redblack::collections::RBTree;
/// // Order strings by length first, limited to a prefix given by the context.
/// let mut t = RBTree::with_context(
///     |a: &String, b: &String, n: &usize| {
///         let (a, b) = (&a[..a.len().min(*n)], &b[..b.len().min(*n)]);
///         a.len().cmp(&b.len()).then(a.cmp(b))
///     },
///     3,
/// );
/// t.insert("abcd".to_string(), 1);
/// t.insert("abc".to_string(), 2);
/// assert_eq!(t.len(), 1);
/// assert_eq!(t.comparator().context(), &3);
/// ```
#[derive(Clone, Debug)]
pub struct WithContext<F, C> {
    f: F,
    context: C,
}

impl<F, C> WithContext<F, C> {
    /// Pair comparison function `f` with `context`.
    pub fn new(f: F, context: C) -> Self {
        Self { f, context }
    }

    /// The context value passed to each comparison.
    pub fn context(&self) -> &C {
        &self.context
    }
}

impl<K, F, C> Compare<K> for WithContext<F, C>
where
    F: Fn(&K, &K, &C) -> Ordering,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.f)(a, b, &self.context)
    }
}
