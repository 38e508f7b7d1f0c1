//! End-to-end coherence behaviour of unified containers
//!
//! Covers the state machine as seen through the public container API:
//! - dirty-range bookkeeping across writes, pushes and reads
//! - transfer idempotence (counted through the CPU backend)
//! - capacity growth with either side authoritative
//! - a model-based property test against a plain `Vec`

use std::sync::Arc;

use proptest::prelude::*;
use warp_unified::{CoherenceEngine, CpuBackend, DirtyRange, MemoryState, UnifiedVec, algorithms};

fn range(start: usize, end: usize) -> DirtyRange {
    DirtyRange::new(start, end).unwrap()
}

fn shared_vec(items: &[u32]) -> (Arc<CpuBackend>, UnifiedVec<u32>) {
    let backend = Arc::new(CpuBackend::new());
    let mut vec = UnifiedVec::with_backend(Arc::clone(&backend)).unwrap();
    vec.extend_from_slice(items).unwrap();
    (backend, vec)
}

#[test]
fn test_write_push_read_walkthrough() {
    let (_, mut vec) = shared_vec(&[5, 2, 8, 1, 9]);
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);

    vec.prefetch_to_device().unwrap();
    assert_eq!(vec.engine().state(), MemoryState::Clean);
    assert!(vec.engine().dirty_ranges().is_empty());

    vec.at(0).unwrap().set(100).unwrap();
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);
    assert_eq!(vec.engine().dirty_ranges(), vec![range(0, 1)]);

    vec.push_back(42).unwrap();
    assert_eq!(vec.len(), 6);
    assert_eq!(vec.engine().dirty_ranges(), vec![range(0, 1), range(5, 6)]);

    assert_eq!(vec.at(3).unwrap().get().unwrap(), 1);
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);
    assert_eq!(vec.engine().dirty_ranges(), vec![range(0, 1), range(5, 6)]);
}

#[test]
fn test_round_trip_through_device() {
    let (_, mut vec) = shared_vec(&[1, 2, 3, 4]);
    algorithms::for_each(&mut vec, |v| *v = *v * *v).unwrap();
    assert_eq!(vec.engine().state(), MemoryState::DeviceDirty);

    assert_eq!(vec.to_vec().unwrap(), vec![1, 4, 9, 16]);
    assert_eq!(vec.engine().state(), MemoryState::Clean);
}

#[test]
fn test_sync_to_device_is_idempotent() {
    let (backend, vec) = shared_vec(&[1, 2, 3]);

    vec.engine().sync_to_device().unwrap();
    let after_first = backend.stats();
    vec.engine().sync_to_device().unwrap();
    vec.engine().sync_to_device().unwrap();

    assert_eq!(backend.stats(), after_first);
    assert_eq!(after_first.host_to_device, 1);
    assert_eq!(after_first.allocations, 1);
}

#[test]
fn test_sync_to_host_is_idempotent() {
    let (backend, mut vec) = shared_vec(&[1, 2, 3]);
    algorithms::fill(&mut vec, 4).unwrap();

    vec.engine().sync_to_host().unwrap();
    vec.engine().sync_to_host().unwrap();
    for value in vec.iter() {
        assert_eq!(value.unwrap(), 4);
    }
    assert_eq!(backend.stats().device_to_host, 1);
}

#[test]
fn test_adjacent_writes_collapse_to_one_transfer() {
    let (backend, vec) = shared_vec(&[0; 8]);
    vec.prefetch_to_device().unwrap();
    let before = backend.stats().host_to_device;

    for index in 2..6 {
        vec.set(index, index as u32).unwrap();
    }
    assert_eq!(vec.engine().dirty_ranges(), vec![range(2, 6)]);

    vec.prefetch_to_device().unwrap();
    assert_eq!(backend.stats().host_to_device - before, 1);
}

#[test]
fn test_growth_preserves_host_authoritative_data() {
    let (backend, mut vec) = shared_vec(&[1, 2, 3, 4]);
    vec.prefetch_to_device().unwrap();
    vec.set(1, 20).unwrap();
    assert_eq!(vec.capacity(), 4);

    vec.push_back(5).unwrap();
    assert_eq!(vec.capacity(), 8);
    assert_eq!(vec.engine().state(), MemoryState::HostDirty);
    assert_eq!(backend.stats().device_to_device, 1);

    // The device copy must hold both the old contents and the new writes.
    let total = algorithms::reduce(&vec, 0, |a, b| a + b).unwrap();
    assert_eq!(total, 1 + 20 + 3 + 4 + 5);
    assert_eq!(vec.to_vec().unwrap(), vec![1, 20, 3, 4, 5]);
}

#[test]
fn test_growth_preserves_device_authoritative_data() {
    let (_, mut vec) = shared_vec(&[1, 2]);
    algorithms::for_each(&mut vec, |v| *v += 100).unwrap();
    assert_eq!(vec.engine().state(), MemoryState::DeviceDirty);

    vec.reserve(30).unwrap();
    assert_eq!(vec.capacity(), 32);
    assert_eq!(vec.engine().state(), MemoryState::DeviceDirty);
    assert_eq!(vec.to_vec().unwrap(), vec![101, 102]);
}

#[test]
fn test_growth_keeps_clean_truthful() {
    let (_, mut vec) = shared_vec(&[7, 7]);
    vec.prefetch_to_device().unwrap();
    vec.reserve(10).unwrap();
    assert_eq!(vec.engine().state(), MemoryState::Clean);

    // A kernel reading the grown buffer sees the pre-growth contents.
    assert_eq!(algorithms::count(&vec, |v| *v == 7).unwrap(), 2);
}

#[test]
fn test_engine_growth_allocates_new_epoch() {
    let backend = Arc::new(CpuBackend::new());
    let engine = CoherenceEngine::<u16>::new(Arc::clone(&backend), 4).unwrap();
    engine.write_host(0, 4, |s| s.copy_from_slice(&[1, 2, 3, 4])).unwrap();
    engine.sync_to_device().unwrap();
    assert_eq!(engine.epoch(), 1);

    engine.resize(16).unwrap();
    assert_eq!(engine.epoch(), 2);
    assert_eq!(backend.stats().allocations, 2);
    assert_eq!(backend.allocated_bytes(), 32);
}

#[test]
fn test_drop_flushes_without_panicking() {
    let backend = Arc::new(CpuBackend::new());
    {
        let mut vec = UnifiedVec::<u32>::with_backend(Arc::clone(&backend)).unwrap();
        vec.extend_from_slice(&[1, 2, 3]).unwrap();
        algorithms::fill(&mut vec, 0).unwrap();
    }
    assert_eq!(backend.stats().device_to_host, 1);
    assert_eq!(backend.allocated_bytes(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Push(u32),
    Set(usize, u32),
    Insert(usize, u32),
    Erase(usize),
    Pop,
    Kernel(u32),
    Prefetch,
    Read(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u32>().prop_map(Op::Push),
        2 => (any::<usize>(), any::<u32>()).prop_map(|(i, v)| Op::Set(i, v)),
        1 => (any::<usize>(), any::<u32>()).prop_map(|(i, v)| Op::Insert(i, v)),
        1 => any::<usize>().prop_map(Op::Erase),
        1 => Just(Op::Pop),
        1 => (0u32..1000).prop_map(Op::Kernel),
        1 => Just(Op::Prefetch),
        1 => any::<usize>().prop_map(Op::Read),
    ]
}

proptest! {
    /// Property: the container matches a plain Vec and the state invariants
    /// hold after every operation
    #[test]
    fn container_matches_model(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut vec = UnifiedVec::<u32>::new().unwrap();
        let mut model: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                Op::Push(v) => {
                    vec.push_back(v).unwrap();
                    model.push(v);
                }
                Op::Set(i, v) if !model.is_empty() => {
                    let i = i % model.len();
                    vec.set(i, v).unwrap();
                    model[i] = v;
                }
                Op::Insert(i, v) => {
                    let i = i % (model.len() + 1);
                    vec.insert(i, v).unwrap();
                    model.insert(i, v);
                }
                Op::Erase(i) if !model.is_empty() => {
                    let i = i % model.len();
                    vec.erase(i).unwrap();
                    model.remove(i);
                }
                Op::Pop => {
                    prop_assert_eq!(vec.pop().unwrap(), model.pop());
                }
                Op::Kernel(delta) => {
                    algorithms::for_each(&mut vec, move |v| *v = v.wrapping_add(delta)).unwrap();
                    for v in &mut model {
                        *v = v.wrapping_add(delta);
                    }
                }
                Op::Prefetch => vec.prefetch_to_device().unwrap(),
                Op::Read(i) if !model.is_empty() => {
                    let i = i % model.len();
                    prop_assert_eq!(vec.get(i).unwrap(), model[i]);
                }
                _ => {}
            }

            let engine = vec.engine();
            let dirty = engine.dirty_ranges();
            prop_assert_eq!(!dirty.is_empty(), engine.state() == MemoryState::HostDirty);
            prop_assert!(dirty.iter().all(|r| r.end() <= engine.capacity()));
            prop_assert!(vec.len() <= vec.capacity());
        }

        prop_assert_eq!(vec.to_vec().unwrap(), model);
    }
}
