//! 虚拟内存失败测试
//!
//! 提交失败、提交上限、地址空间耗尽与碎片化：分配返回可区分的 OOM 原因，
//! 已提交的状态与已有对象保持不变，故障解除后重试成功。

use std::sync::Arc;

use vm_heap::{
    AllocRequest, CollectionReason, ExpansionMechanism, GcConfig, GcError, Generation,
    HandleKind, HeapManager, OomReason, SimulatedVirtualMemory, VirtualMemory,
};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn config(address_space_size: usize) -> GcConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    GcConfig {
        address_space_size,
        initial_segment_size: 4 * MB,
        max_segment_size: 4 * MB,
        concurrent: false,
        gc_threads: 1,
        verify_heap: true,
        budgets: [2 * MB, 2 * MB, 64 * MB, 64 * MB, 64 * MB],
        ..GcConfig::default()
    }
}

fn heap_on(config: GcConfig) -> (HeapManager, Arc<SimulatedVirtualMemory>) {
    let vmem = Arc::new(SimulatedVirtualMemory::new(
        config.base(),
        config.address_space_size,
    ));
    let heap =
        HeapManager::with_virtual_memory(config, Arc::clone(&vmem) as Arc<dyn VirtualMemory>)
            .unwrap();
    (heap, vmem)
}

fn oom_reason(err: &GcError) -> Option<OomReason> {
    match err {
        GcError::OutOfMemory { reason, .. } => Some(*reason),
        _ => None,
    }
}

fn pinned(size: usize) -> AllocRequest {
    AllocRequest::new(size).generation(Generation::Pinned)
}

#[test]
fn test_commit_failure_keeps_committed_state() {
    let (heap, vmem) = heap_on(config(64 * MB));
    let keep = heap.allocate(64, Generation::Gen0).unwrap();
    let handle = heap.create_handle(HandleKind::Strong, keep).unwrap();
    let committed = heap.committed_bytes();
    assert!(committed > 0);

    // 首次尝试与 OOM 前回收后的重试都提交失败
    vmem.fail_next_commits(2);
    let err = heap.allocate(256 * KB, Generation::Gen0).unwrap_err();
    assert_eq!(oom_reason(&err), Some(OomReason::CommitFailed));
    assert_eq!(
        heap.last_collection().unwrap().reason,
        CollectionReason::LastGcBeforeOom
    );

    let history = heap.oom_history(0).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, OomReason::CommitFailed);
    assert_eq!(history[0].requested_size, 256 * KB);
    assert_eq!(history[0].generation, Generation::Large);
    assert_eq!(heap.stats().allocation_failures, 1);

    assert!(heap.committed_bytes() >= committed);
    let keep = heap.handle_target(handle).unwrap().unwrap();
    assert!(heap.is_alive(keep));

    let big = heap.allocate(256 * KB, Generation::Gen0).unwrap();
    assert_eq!(heap.object_info(big).unwrap().generation, Generation::Large);
    assert_eq!(heap.oom_history(0).unwrap().len(), 1);
}

#[test]
fn test_commit_limit_blocks_growth_only() {
    let (heap, vmem) = heap_on(config(64 * MB));
    let keep = heap.allocate(64, Generation::Gen0).unwrap();
    heap.create_handle(HandleKind::Strong, keep).unwrap();

    vmem.set_commit_limit(Some(heap.committed_bytes()));
    let err = heap.allocate(256 * KB, Generation::Gen0).unwrap_err();
    assert_eq!(oom_reason(&err), Some(OomReason::CommitFailed));
    // 已提交范围内的分配不受影响
    let small = heap.allocate(64, Generation::Gen0).unwrap();
    assert!(heap.is_alive(small));

    vmem.set_commit_limit(None);
    heap.allocate(256 * KB, Generation::Gen0).unwrap();
    let history = heap.oom_history(0).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, OomReason::CommitFailed);
}

#[test]
fn test_address_space_exhaustion_and_fragmentation() {
    // 两个 4MB 固定段占满地址空间
    let (heap, _vmem) = heap_on(config(8 * MB));
    let mut handles = Vec::new();
    let err = loop {
        match heap.allocate_with(pinned(512 * KB)) {
            Ok(obj) => handles.push(heap.create_handle(HandleKind::Strong, obj).unwrap()),
            Err(err) => break err,
        }
        assert!(handles.len() <= 64, "address space never ran out");
    };
    assert_eq!(oom_reason(&err), Some(OomReason::AddressSpaceExhausted));
    assert!(handles.len() >= 4);
    for handle in &handles {
        let obj = heap.handle_target(*handle).unwrap().unwrap();
        assert!(heap.is_alive(obj));
    }
    let counters = heap.heap_counters(0).unwrap();
    assert!(counters.expansions(ExpansionMechanism::NoMemory) >= 1);

    // 隔一个释放一个：空闲总量足够，但没有连续 1MB
    for handle in handles.iter().skip(1).step_by(2) {
        heap.free_handle(*handle).unwrap();
    }
    heap.induce_collection(Generation::Gen2, CollectionReason::Induced)
        .unwrap();
    assert_eq!(heap.object_count(), handles.len().div_ceil(2));

    let err = heap.allocate_with(pinned(MB)).unwrap_err();
    assert_eq!(oom_reason(&err), Some(OomReason::Fragmentation));
    let reasons: Vec<_> = heap
        .oom_history(0)
        .unwrap()
        .iter()
        .map(|e| e.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![OomReason::AddressSpaceExhausted, OomReason::Fragmentation]
    );

    // 空闲块容得下的请求照常成功
    let reused = heap.allocate_with(pinned(512 * KB)).unwrap();
    assert_eq!(heap.object_info(reused).unwrap().generation, Generation::Pinned);
    assert_eq!(heap.stats().allocation_failures, 2);
}
