use super::*;
use crate::alloc::{AllocError, Pool};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

const REP: usize = if cfg!(miri) { 2 } else { 10 };
const N: usize = if cfg!(miri) { 100 } else { 10000 };

fn entries<K: Clone, V: Clone, C, A: Allocator>(t: &RBTree<K, V, C, A>) -> Vec<(K, V)> {
    let mut out = Vec::new();
    let _ = t.traverse(|k, v| {
        out.push((k.clone(), v.clone()));
        ControlFlow::Continue(())
    });
    out
}

fn check<K, V, C: Compare<K>, A: Allocator>(t: &RBTree<K, V, C, A>) {
    if let Err(e) = t.check_invariants() {
        panic!("invariant broken: {e}");
    }
    assert_eq!(t.size(), t.len());
}

/// Records everything the release hooks are given.
#[derive(Clone, Default)]
struct Released<K, V> {
    keys: Arc<Mutex<Vec<K>>>,
    values: Arc<Mutex<Vec<V>>>,
}

impl<K: Send + 'static, V: Send + 'static> Released<K, V> {
    fn tree<C: Compare<K>>(&self, cmp: C) -> RBTree<K, V, C> {
        let (keys, values) = (self.keys.clone(), self.values.clone());
        RBTree::builder(cmp)
            .key_release(move |k| keys.lock().push(k))
            .value_release(move |v| values.lock().push(v))
            .build()
    }

    fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.keys.lock().clone()
    }

    fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.values.lock().clone()
    }
}

/// Allocator counting calls to `allocate`.
#[derive(Default)]
struct Counting {
    allocs: AtomicUsize,
}

impl Counting {
    fn allocs(&self) -> usize {
        self.allocs.load(AtomicOrdering::Relaxed)
    }
}

unsafe impl Allocator for Counting {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocs.fetch_add(1, AtomicOrdering::Relaxed);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        Global.deallocate(ptr, layout)
    }
}

fn by_number(a: &(i32, &'static str), b: &(i32, &'static str)) -> Ordering {
    a.0.cmp(&b.0)
}

#[test]
fn example_insert_then_remove() {
    let mut t = RBTree::new();
    for (k, v) in [(5, "a"), (3, "b"), (8, "c"), (1, "d"), (4, "e")] {
        t.insert(k, v);
        check(&t);
    }
    assert_eq!(
        entries(&t),
        [(1, "d"), (3, "b"), (4, "e"), (5, "a"), (8, "c")]
    );
    assert!(t.height() <= 3);
    assert_eq!(t.size(), 5);

    assert!(t.remove(&3));
    check(&t);
    assert_eq!(entries(&t), [(1, "d"), (4, "e"), (5, "a"), (8, "c")]);
    assert_eq!(t.lookup(&3), None);
}

#[test]
fn empty_tree() {
    let t = RBTree::<u32, u32>::new();
    assert!(t.is_empty());
    assert_eq!(t.size(), 0);
    assert_eq!(t.height(), 0);
    assert_eq!(t.lookup(&1), None);
    assert_eq!(t.first_key_value(), None);
    assert_eq!(t.last_key_value(), None);
    assert_eq!(t.check_invariants(), Ok(0));
    assert!(t.traverse(|_, _| ControlFlow::Break(())).is_continue());
}

#[test]
fn insert_keeps_stored_key() {
    let r = Released::default();
    let mut t = r.tree(by_number);
    t.insert((1, "old"), 10);
    t.insert((1, "new"), 20);
    assert_eq!(t.lookup_extended(&(1, "")), Some((&(1, "old"), &20)));
    assert_eq!(r.keys(), [(1, "new")]);
    assert_eq!(r.values(), [10]);
    assert_eq!(t.len(), 1);
}

#[test]
fn replace_swaps_key_and_value() {
    let r = Released::default();
    let mut t = r.tree(by_number);
    t.insert((1, "old"), 10);
    t.replace((1, "new"), 20);
    assert_eq!(t.lookup_extended(&(1, "")), Some((&(1, "new"), &20)));
    assert_eq!(r.keys(), [(1, "old")]);
    assert_eq!(r.values(), [10]);

    // Absent key: replace inserts.
    t.replace((2, "two"), 30);
    assert_eq!(t.lookup(&(2, "")), Some(&30));
    assert_eq!(r.values(), [10]);
    check(&t);
}

#[test]
fn remove_absent_is_noop() {
    let r = Released::default();
    let mut t = r.tree(Natural);
    for i in 0..10 {
        t.insert(i * 2, i);
    }
    assert!(!t.remove(&3));
    assert_eq!(t.steal(&5), None);
    assert_eq!(t.len(), 10);
    assert!(r.keys().is_empty());
    check(&t);
}

#[test]
fn remove_runs_hooks_once_steal_none() {
    let r = Released::default();
    let mut t = r.tree(Natural);
    for i in 0..20u32 {
        t.insert(i, i + 100);
    }
    assert!(t.remove(&7));
    assert_eq!(r.keys(), [7]);
    assert_eq!(r.values(), [107]);

    assert_eq!(t.steal(&8), Some((8, 108)));
    assert_eq!(r.keys(), [7]);
    assert_eq!(r.values(), [107]);
    assert_eq!(t.lookup(&8), None);
    check(&t);

    drop(t);
    let mut keys = r.keys();
    keys.sort_unstable();
    let expected: Vec<u32> = (0..20).filter(|k| *k != 8).collect();
    assert_eq!(keys, expected);
    assert_eq!(r.values().len(), 19);
}

#[test]
fn two_child_removal_keeps_successor_value() {
    let mut t = RBTree::new();
    for k in [50, 30, 70, 20, 40, 60, 80, 65] {
        t.insert(k, k * 10);
    }
    // 70 has two children; its successor 80 is moved into its record.
    assert_eq!(t.steal(&70), Some((70, 700)));
    check(&t);
    for k in [50, 30, 20, 40, 60, 80, 65] {
        assert_eq!(t.lookup(&k), Some(&(k * 10)));
    }
    // Root removal.
    let root = *t.store.key(t.store.root);
    assert_eq!(t.steal(&root), Some((root, root * 10)));
    check(&t);
    assert_eq!(t.len(), 6);
}

#[test]
fn replace_round_trip_releases_old_value_once() {
    let r = Released::default();
    let mut t = r.tree(Natural);
    t.insert("k".to_string(), "v1".to_string());
    t.replace("k".to_string(), "v2".to_string());
    assert_eq!(t.lookup(&"k".to_string()), Some(&"v2".to_string()));
    assert_eq!(r.values(), ["v1".to_string()]);
    assert_eq!(r.keys(), ["k".to_string()]);
}

#[test]
fn drop_releases_post_order() {
    let r = Released::default();
    let mut t = r.tree(Natural);
    for k in [1, 2, 3] {
        t.insert(k, k);
    }
    drop(t);
    assert_eq!(r.keys(), [3, 1, 2]);
    assert_eq!(r.values(), [3, 1, 2]);
}

#[test]
fn clear_then_reuse() {
    let r = Released::default();
    let mut t = r.tree(Natural);
    for i in 0..100 {
        t.insert(i, i);
    }
    t.clear();
    assert!(t.is_empty());
    assert_eq!(t.len(), 0);
    assert_eq!(r.keys().len(), 100);
    check(&t);
    for i in 0..50 {
        t.insert(i, i);
    }
    check(&t);
    assert_eq!(t.size(), 50);
}

#[test]
fn traverse_stops_early() {
    let t: RBTree<_, _> = (0..100).map(|i| (i, ())).collect();
    let mut visited = Vec::new();
    let flow = t.traverse(|k, _| {
        visited.push(*k);
        if *k == 9 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    assert!(flow.is_break());
    assert_eq!(visited, (0..10).collect::<Vec<_>>());
}

#[test]
fn size_after_inserts_and_removes() {
    let mut t = RBTree::new();
    for i in 0..N {
        t.insert(i, i);
    }
    assert_eq!(t.size(), N);
    for i in (0..N).step_by(3) {
        assert!(t.remove(&i));
    }
    assert_eq!(t.size(), N - N.div_ceil(3));
    check(&t);
}

#[test]
fn height_stays_within_bound() {
    for n in [1usize, 2, 3, 7, 8, 100, 1000, N] {
        let mut asc = RBTree::new();
        let mut desc = RBTree::new();
        for i in 0..n {
            asc.insert(i, ());
            desc.insert(n - i, ());
        }
        let bound = 2.0 * ((n + 1) as f64).log2();
        assert!(asc.height() as f64 <= bound, "n={n} h={}", asc.height());
        assert!(desc.height() as f64 <= bound, "n={n} h={}", desc.height());
        check(&asc);
        check(&desc);
    }
}

#[test]
fn random_against_std() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _rep in 0..REP {
        let mut t = RBTree::new();
        let mut m = std::collections::BTreeMap::new();
        for step in 0..N {
            let k = rng.gen_range(0..N / 4);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    t.insert(k, step);
                    m.insert(k, step);
                }
                2 => {
                    assert_eq!(t.remove(&k), m.remove(&k).is_some());
                }
                _ => {
                    assert_eq!(t.lookup(&k), m.get(&k));
                }
            }
            if step % 512 == 0 {
                check(&t);
            }
        }
        check(&t);
        assert_eq!(entries(&t), m.into_iter().collect::<Vec<_>>());
    }
}

#[test]
fn comparator_with_context() {
    let mut t = RBTree::with_context(
        |a: &i32, b: &i32, reverse: &bool| if *reverse { b.cmp(a) } else { a.cmp(b) },
        true,
    );
    for i in 0..10 {
        t.insert(i, i);
    }
    assert_eq!(t.first_key_value(), Some((&9, &9)));
    assert_eq!(t.last_key_value(), Some((&0, &0)));
    assert!(*t.comparator().context());
    check(&t);
}

#[test]
fn lookup_mut_updates_in_place() {
    let mut t = RBTree::from([(1, 1), (2, 2), (3, 3)]);
    if let Some(v) = t.lookup_mut(&2) {
        *v = 20;
    }
    assert_eq!(t[&2], 20);
    assert!(t.lookup_mut(&4).is_none());
    assert!(t.contains_key(&3));
}

#[test]
#[should_panic(expected = "no entry found for key")]
fn index_missing_panics() {
    let t = RBTree::from([(1, 1)]);
    let _v = t[&2];
}

#[test]
fn debug_lists_in_order() {
    let t = RBTree::from([(2, 'b'), (1, 'a'), (3, 'c')]);
    assert_eq!(format!("{t:?}"), "{1: 'a', 2: 'b', 3: 'c'}");
}

#[test]
fn freed_nodes_are_reused() {
    let counting = Counting::default();
    let mut t = RBTree::new_in(&counting);
    for i in 0..100 {
        t.insert(i, i);
    }
    let grown = counting.allocs();
    for i in 0..100 {
        assert!(t.remove(&i));
    }
    for i in 100..200 {
        t.insert(i, i);
    }
    assert_eq!(counting.allocs(), grown);
    check(&t);
}

#[test]
fn try_reserve_avoids_growth() {
    let counting = Counting::default();
    let mut t = RBTree::new_in(&counting);
    t.try_reserve(1000).unwrap();
    let before = counting.allocs();
    for i in 0..1000 {
        t.insert(i, i);
    }
    assert_eq!(counting.allocs(), before);

    let e = t.try_reserve(usize::MAX).unwrap_err();
    assert!(matches!(e.kind(), crate::collections::TryReserveErrorKind::CapacityOverflow));
    let e = t.try_reserve(usize::MAX / 2).unwrap_err();
    assert!(matches!(e.kind(), crate::collections::TryReserveErrorKind::CapacityOverflow));
    assert_eq!(t.len(), 1000);
}

#[test]
fn pool_shared_between_trees() {
    let pool = Pool::new();
    for _rep in 0..REP {
        let mut t = RBTree::new_in(pool.clone());
        for i in 0..100u64 {
            t.insert(i, i);
        }
        check(&t);
    }
    let stats = pool.stats();
    // Every buffer after the first round comes back out of the pool.
    assert!(stats.hits >= (REP as u64 - 1) * 5, "{stats:?}");
}

#[test]
fn pool_across_threads() {
    let pool = Pool::new();
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut t = RBTree::new_in(pool);
                for i in 0..1000u32 {
                    t.insert(i * 4 + n, i);
                }
                let checked = t.check_invariants();
                checked.map(|_| t.len())
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Ok(1000));
    }
}

#[test]
fn tree_moves_between_threads() {
    let mut t = RBTree::new();
    t.insert(1, "one".to_string());
    let t = std::thread::spawn(move || {
        t.insert(2, "two".to_string());
        t
    })
    .join()
    .unwrap();
    assert_eq!(t.len(), 2);
}

#[test]
fn invariant_error_display() {
    let e = InvariantError::BlackHeightMismatch { left: 2, right: 3 };
    assert_eq!(e.to_string(), "black-height mismatch: left 2, right 3");
    assert_eq!(InvariantError::RedRoot.to_string(), "root is red");
}

#[test]
fn exp_mem_test() {
    let mut t = RBTree::new();
    for i in 0..N as u32 {
        t.insert(i, 1u8);
    }
    print_memory();
    println!("Node record size: {} bytes", std::mem::size_of::<store::Node<u32, u8>>());
}
