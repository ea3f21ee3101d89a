//! 回收器属性测试
//!
//! 随机的分配/写引用/根操作序列之后检查：
//! - 可达对象不丢失（压缩后按形状比较）
//! - 老→新引用写入后卡片必为脏
//! - 连续两次完全回收，第二次不再释放任何对象
//! - 没有后台周期时诊断快照稳定且可往返
//! - OOM 历史环只保留最近的事件

use std::collections::{HashSet, VecDeque};

use proptest::prelude::*;
use vm_heap::object::slot_address;
use vm_heap::{
    Address, AllocRequest, CollectionReason, DiagnosticSnapshot, FieldSource, GcConfig,
    Generation, HandleId, HandleKind, HeapManager, OomEvent, OomHistory, OomReason, Stability,
};

const MB: usize = 1024 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: usize, tier: u8, slots: usize },
    Link { from: usize, slot: usize, to: usize },
    Unlink { from: usize, slot: usize },
    Root { index: usize },
    Unroot { index: usize },
    Collect { tier: u8, compacting: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (24usize..2048, 0u8..3, 0usize..4)
            .prop_map(|(size, tier, slots)| Op::Alloc { size, tier, slots }),
        4 => (any::<usize>(), 0usize..4, any::<usize>())
            .prop_map(|(from, slot, to)| Op::Link { from, slot, to }),
        1 => (any::<usize>(), 0usize..4).prop_map(|(from, slot)| Op::Unlink { from, slot }),
        2 => any::<usize>().prop_map(|index| Op::Root { index }),
        1 => any::<usize>().prop_map(|index| Op::Unroot { index }),
        1 => (0u8..3, any::<bool>()).prop_map(|(tier, compacting)| Op::Collect { tier, compacting }),
    ]
}

fn generation_of(tier: u8) -> Generation {
    match tier {
        0 => Generation::Gen0,
        1 => Generation::Gen1,
        _ => Generation::Gen2,
    }
}

fn new_heap() -> HeapManager {
    HeapManager::new(GcConfig {
        address_space_size: 64 * MB,
        initial_segment_size: MB,
        max_segment_size: 8 * MB,
        concurrent: false,
        gc_threads: 2,
        verify_heap: true,
        budgets: [MB, MB, 4 * MB, 4 * MB, MB],
        ..GcConfig::default()
    })
    .unwrap()
}

/// 从根出发的可达形状：(对象, 总字节, 非空边数)
fn reachable(heap: &HeapManager, roots: &[HandleId]) -> (Vec<Address>, usize, usize) {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<Address> = roots
        .iter()
        .filter_map(|h| heap.handle_target(*h).unwrap())
        .collect();
    let (mut bytes, mut edges) = (0, 0);
    let mut order = Vec::new();
    while let Some(obj) = queue.pop_front() {
        if !seen.insert(obj) {
            continue;
        }
        let info = heap.object_info(obj).expect("reachable object was freed");
        bytes += info.size;
        order.push(obj);
        for slot in 0..info.ref_slots {
            if let Some(target) = heap.read_ref(obj, slot).unwrap() {
                edges += 1;
                queue.push_back(target);
            }
        }
    }
    (order, bytes, edges)
}

struct Model {
    heap: HeapManager,
    objects: Vec<Address>,
    roots: Vec<HandleId>,
}

impl Model {
    fn new() -> Self {
        Self {
            heap: new_heap(),
            objects: Vec::new(),
            roots: Vec::new(),
        }
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        match *op {
            Op::Alloc { size, tier, slots } => {
                let collections = self.heap.stats().total_collections();
                let obj = self
                    .heap
                    .allocate_with(AllocRequest::new(size).generation(generation_of(tier)).ref_slots(slots))
                    .unwrap();
                // 分配触发了回收：旧地址可能已失效
                if self.heap.stats().total_collections() != collections {
                    self.objects = reachable(&self.heap, &self.roots).0;
                }
                self.objects.push(obj);
            }
            Op::Link { from, slot, to } if !self.objects.is_empty() => {
                let src = self.objects[from % self.objects.len()];
                let dst = self.objects[to % self.objects.len()];
                let info = self.heap.object_info(src).unwrap();
                if info.ref_slots == 0 {
                    return Ok(());
                }
                let slot = slot % info.ref_slots;
                self.heap.write_ref(src, slot, dst).unwrap();
                let dst_tier = self.heap.object_info(dst).unwrap().generation.tier();
                if info.generation.tier() > dst_tier {
                    prop_assert!(self.heap.card_table().is_dirty(slot_address(src, slot)));
                }
            }
            Op::Unlink { from, slot } if !self.objects.is_empty() => {
                let src = self.objects[from % self.objects.len()];
                let slots = self.heap.object_info(src).unwrap().ref_slots;
                if slots > 0 {
                    self.heap.write_ref(src, slot % slots, Address::NULL).unwrap();
                }
            }
            Op::Root { index } if !self.objects.is_empty() => {
                let obj = self.objects[index % self.objects.len()];
                self.roots.push(self.heap.create_handle(HandleKind::Strong, obj).unwrap());
            }
            Op::Unroot { index } if !self.roots.is_empty() => {
                let handle = self.roots.swap_remove(index % self.roots.len());
                self.heap.free_handle(handle).unwrap();
            }
            Op::Collect { tier, compacting } => {
                let (before, bytes, edges) = reachable(&self.heap, &self.roots);
                let reason = if compacting {
                    CollectionReason::InducedCompacting
                } else {
                    CollectionReason::Induced
                };
                self.heap
                    .induce_collection(generation_of(tier), reason)
                    .unwrap();
                let (after, bytes_after, edges_after) = reachable(&self.heap, &self.roots);
                prop_assert_eq!(before.len(), after.len());
                prop_assert_eq!(bytes, bytes_after);
                prop_assert_eq!(edges, edges_after);
                prop_assert!(self.heap.object_count() >= after.len());
                self.objects = after;
            }
            _ => {}
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 属性测试: 可达对象在任意回收后保持不变
    #[test]
    fn prop_no_reachable_object_is_lost(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        let (before, bytes, _) = reachable(&model.heap, &model.roots);
        let summary = model
            .heap
            .induce_collection(Generation::Gen2, CollectionReason::InducedCompacting)
            .unwrap();
        let (after, bytes_after, _) = reachable(&model.heap, &model.roots);
        prop_assert_eq!(before.len(), after.len());
        prop_assert_eq!(bytes, bytes_after);
        // 完全回收之后只剩可达对象
        prop_assert_eq!(model.heap.object_count(), after.len());
        prop_assert_eq!(summary.condemned, Generation::Gen2);
    }

    /// 属性测试: 第二次完全回收没有可清除的对象
    #[test]
    fn prop_sweep_is_idempotent(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        model.heap.induce_collection(Generation::Gen2, CollectionReason::Induced).unwrap();
        let count = model.heap.object_count();
        let second = model
            .heap
            .induce_collection(Generation::Gen2, CollectionReason::Induced)
            .unwrap();
        prop_assert_eq!(second.objects_freed, 0);
        prop_assert_eq!(second.bytes_freed, 0);
        prop_assert_eq!(model.heap.object_count(), count);
    }

    /// 属性测试: 老对象指向年轻对象的槽在回收后仍被卡片覆盖
    #[test]
    fn prop_cards_cover_old_to_young_after_collection(
        ops in prop::collection::vec(op_strategy(), 1..80),
        tier in 0u8..2,
    ) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        model.heap.induce_collection(generation_of(tier), CollectionReason::Induced).unwrap();
        let (objects, _, _) = reachable(&model.heap, &model.roots);
        for obj in objects {
            let info = model.heap.object_info(obj).unwrap();
            for slot in 0..info.ref_slots {
                if let Some(target) = model.heap.read_ref(obj, slot).unwrap() {
                    let target_tier = model.heap.object_info(target).unwrap().generation.tier();
                    if info.generation.tier() > target_tier {
                        prop_assert!(model.heap.card_table().is_dirty(slot_address(obj, slot)));
                    }
                }
            }
        }
    }

    /// 属性测试: 静止时诊断读取稳定，快照往返后读数一致
    #[test]
    fn prop_diagnostics_stable_when_quiescent(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        let reader = model.heap.diagnostics();
        let snapshot = reader.snapshot().unwrap();
        let restored = DiagnosticSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        prop_assert_eq!(&restored, &snapshot);

        for descriptor in vm_heap::diagnostics::CATALOGUE.iter() {
            let live = reader.read(0, descriptor.name, descriptor.type_tag).unwrap();
            let saved = restored.read(0, descriptor.name, descriptor.type_tag).unwrap();
            prop_assert_eq!(live.stability, Stability::Stable);
            prop_assert_eq!(live.value, saved.value);
        }
    }

    /// 属性测试: OOM 历史环保留最近 capacity 条，按记录顺序
    #[test]
    fn prop_oom_ring_keeps_latest(
        capacity in 1usize..8,
        sizes in prop::collection::vec(1usize..1 << 20, 0..32),
    ) {
        let mut history = OomHistory::new(capacity);
        for (i, &size) in sizes.iter().enumerate() {
            history.record(OomEvent::new(OomReason::Fragmentation, size, Generation::Gen0, i as u64));
        }
        let kept: Vec<usize> = history.iter().map(|e| e.requested_size).collect();
        let expected = &sizes[sizes.len().saturating_sub(capacity)..];
        prop_assert_eq!(kept.as_slice(), expected);
        prop_assert_eq!(history.total_recorded(), sizes.len() as u64);
        prop_assert!(history.len() <= capacity);
        let indices: Vec<u64> = history.iter().map(|e| e.gc_index).collect();
        prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }
}
