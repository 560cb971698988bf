//! Property tests: containers against std models

use cowstore::{Allocator, Container, EngineConfig, Lookup, Map, Set, Vector};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
enum MapOp {
    Insert(u16, u32),
    Remove(u16),
    RemoveRange(u16, u16),
}

fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        6 => (any::<u16>(), any::<u32>()).prop_map(|(k, v)| MapOp::Insert(k % 2_000, v)),
        3 => any::<u16>().prop_map(|k| MapOp::Remove(k % 2_000)),
        1 => (any::<u16>(), 0u16..100).prop_map(|(k, n)| MapOp::RemoveRange(k % 2_000, n)),
    ]
}

#[derive(Clone, Debug)]
enum VecOp {
    Push(u64),
    Insert(u16, u64),
    Remove(u16),
    Set(u16, u64),
    Pop,
}

fn vec_op() -> impl Strategy<Value = VecOp> {
    prop_oneof![
        4 => any::<u64>().prop_map(VecOp::Push),
        2 => (any::<u16>(), any::<u64>()).prop_map(|(i, v)| VecOp::Insert(i, v)),
        2 => any::<u16>().prop_map(VecOp::Remove),
        1 => (any::<u16>(), any::<u64>()).prop_map(|(i, v)| VecOp::Set(i, v)),
        1 => Just(VecOp::Pop),
    ]
}

fn small_blocks() -> EngineConfig {
    EngineConfig::default().with_block_size(256)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Test that a map behaves like BTreeMap and stays balanced
    #[test]
    fn prop_map_matches_btreemap(ops in prop::collection::vec(map_op(), 1..1_500)) {
        let alloc = Allocator::in_memory(small_blocks()).unwrap();
        let snap = alloc.create_snapshot(None);
        let mut map: Map<u64, String> = snap.create().unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                MapOp::Insert(k, v) => {
                    let (k, v) = (u64::from(k), v.to_string());
                    prop_assert_eq!(map.insert(k, v.clone()).unwrap(), model.insert(k, v));
                }
                MapOp::Remove(k) => {
                    let k = u64::from(k);
                    prop_assert_eq!(map.remove(&k).unwrap(), model.remove(&k));
                }
                MapOp::RemoveRange(k, n) => {
                    let (start, end) = (u64::from(k), u64::from(k) + u64::from(n));
                    let doomed: Vec<u64> = model.range(start..end).map(|(k, _)| *k).collect();
                    for k in &doomed {
                        model.remove(k);
                    }
                    prop_assert_eq!(map.remove_range(start..end).unwrap(), doomed.len() as u64);
                }
            }
        }

        prop_assert_eq!(map.len().unwrap(), model.len() as u64);
        let stats = map.tree().check_invariants().unwrap();
        prop_assert_eq!(stats.entries, model.len() as u64);

        let entries: Vec<(u64, String)> = map.iter().unwrap().map(|e| e.unwrap()).collect();
        let expected: Vec<(u64, String)> = model.into_iter().collect();
        prop_assert_eq!(entries, expected);
    }

    /// Test that rank and select are inverse on a set
    #[test]
    fn prop_set_rank_select(keys in prop::collection::btree_set(any::<u64>(), 0..2_000)) {
        let alloc = Allocator::in_memory(small_blocks()).unwrap();
        let snap = alloc.create_snapshot(None);
        let mut set: Set<u64> = snap.create().unwrap();
        for key in keys.iter().rev() {
            prop_assert!(set.insert(*key).unwrap());
        }

        for (position, key) in keys.iter().enumerate() {
            let position = position as u64;
            prop_assert_eq!(set.rank_of(key).unwrap(), position);
            prop_assert_eq!(set.select(position).unwrap(), Some(*key));
        }
        prop_assert_eq!(set.select(keys.len() as u64).unwrap(), None);
    }

    /// Test that positional edits behave like Vec
    #[test]
    fn prop_vector_matches_vec(ops in prop::collection::vec(vec_op(), 1..1_500)) {
        let alloc = Allocator::in_memory(small_blocks()).unwrap();
        let snap = alloc.create_snapshot(None);
        let mut vector: Vector<u64> = snap.create().unwrap();
        let mut model: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                VecOp::Push(v) => {
                    vector.push(v).unwrap();
                    model.push(v);
                }
                VecOp::Insert(i, v) => {
                    let i = usize::from(i) % (model.len() + 1);
                    vector.insert(i as u64, v).unwrap();
                    model.insert(i, v);
                }
                VecOp::Remove(i) if !model.is_empty() => {
                    let i = usize::from(i) % model.len();
                    prop_assert_eq!(vector.remove(i as u64).unwrap(), model.remove(i));
                }
                VecOp::Set(i, v) if !model.is_empty() => {
                    let i = usize::from(i) % model.len();
                    let old = std::mem::replace(&mut model[i], v);
                    prop_assert_eq!(vector.set(i as u64, v).unwrap(), old);
                }
                VecOp::Pop => prop_assert_eq!(vector.pop().unwrap(), model.pop()),
                _ => {}
            }
        }

        vector.tree().check_invariants().unwrap();
        let values: Vec<u64> = vector.iter().unwrap().map(|v| v.unwrap()).collect();
        prop_assert_eq!(values, model);
    }

    /// Test that a branch diverges from its parent without disturbing it
    #[test]
    fn prop_branches_are_isolated(
        base in prop::collection::btree_set(any::<u32>(), 0..800),
        edits in prop::collection::vec(any::<u32>(), 0..400),
    ) {
        let alloc = Allocator::in_memory(small_blocks()).unwrap();
        let parent = alloc.create_snapshot(None);
        let mut set: Set<u64> = parent.create_named("s").unwrap();
        for key in &base {
            set.insert(u64::from(*key)).unwrap();
        }
        parent.commit().unwrap();

        let branch = parent.branch(None).unwrap();
        let mut copy: Set<u64> = branch.open_named("s").unwrap();
        let mut model: BTreeSet<u64> = base.iter().map(|k| u64::from(*k)).collect();
        for key in edits {
            let key = u64::from(key);
            if key % 2 == 0 {
                prop_assert_eq!(copy.insert(key).unwrap(), model.insert(key));
            } else {
                prop_assert_eq!(copy.remove(&key).unwrap(), model.remove(&key));
            }
        }

        let original: Vec<u64> = set.iter().unwrap().map(|k| k.unwrap()).collect();
        let expected: Vec<u64> = base.iter().map(|k| u64::from(*k)).collect();
        prop_assert_eq!(original, expected);
        let changed: Vec<u64> = copy.iter().unwrap().map(|k| k.unwrap()).collect();
        prop_assert_eq!(changed, model.into_iter().collect::<Vec<_>>());

        // Nothing leaks once the branch is gone
        let shared = alloc.stats();
        branch.drop_snapshot().unwrap();
        prop_assert!(alloc.stats().store.blocks <= shared.store.blocks);
        set.tree().check_invariants().unwrap();
    }
}
