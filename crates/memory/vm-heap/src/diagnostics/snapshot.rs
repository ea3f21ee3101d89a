//! 静态快照：把目录中所有字段拷贝出来，序列化为 JSON 供离线分析

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CATALOGUE, CapabilitySet, FieldDescriptor, FieldSource, FieldValue, Stability};
use crate::error::{GcError, GcResult};

/// 快照中的一个字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotField {
    /// 名称
    pub name: String,
    /// 值
    pub value: FieldValue,
    /// 拍摄时的稳定性
    pub stability: Stability,
}

/// 一个逻辑堆的字段
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeapSnapshot {
    /// 按目录顺序排列
    pub fields: Vec<SnapshotField>,
}

/// 诊断快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    /// 拍摄时的目录版本
    pub version: u32,
    /// 能力集合
    pub capabilities: CapabilitySet,
    /// 拍摄时间
    pub taken_at: DateTime<Utc>,
    /// 每个逻辑堆
    pub heaps: Vec<HeapSnapshot>,
}

impl DiagnosticSnapshot {
    /// 从任意来源拷贝全部字段
    pub fn capture<S: FieldSource + ?Sized>(source: &S) -> GcResult<Self> {
        let capabilities = source.capabilities();
        let version = source.catalogue_version();
        let mut heaps = Vec::with_capacity(source.heap_count());
        for heap in 0..source.heap_count() {
            let mut fields = Vec::with_capacity(CATALOGUE.len());
            for descriptor in CATALOGUE.iter().filter(|d| d.since <= version) {
                let (value, stability) = if capabilities.satisfies(descriptor.requires) {
                    source.read_slot(heap, descriptor)?
                } else {
                    (FieldValue::Missing, Stability::Stable)
                };
                fields.push(SnapshotField {
                    name: descriptor.name.to_string(),
                    value,
                    stability,
                });
            }
            heaps.push(HeapSnapshot { fields });
        }
        Ok(Self {
            version,
            capabilities,
            taken_at: Utc::now(),
            heaps,
        })
    }

    /// 序列化
    pub fn to_json(&self) -> GcResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 反序列化
    pub fn from_json(text: &str) -> GcResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl FieldSource for DiagnosticSnapshot {
    fn catalogue_version(&self) -> u32 {
        self.version
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    fn read_slot(&self, heap: usize, descriptor: &FieldDescriptor) -> GcResult<(FieldValue, Stability)> {
        let heap = self.heaps.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        Ok(heap
            .fields
            .iter()
            .find(|f| f.name == descriptor.name)
            .map(|f| (f.value.clone(), f.stability))
            .unwrap_or((FieldValue::Missing, Stability::Stable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticMirror, DiagnosticReader, FieldId, TypeTag};
    use crate::object::{Address, Generation};
    use crate::oom::{OomEvent, OomReason};
    use std::sync::Arc;

    #[test]
    fn test_snapshot_json_round_trip_preserves_reads() {
        let mirrors: Arc<[DiagnosticMirror]> = vec![DiagnosticMirror::new(4)].into();
        let event = OomEvent::new(OomReason::Fragmentation, 4096, Generation::Large, 9);
        {
            let mut w = mirrors[0].begin();
            w.set(FieldId::SegmentCount, 3);
            w.set_address(FieldId::NextSweepObj, Address(0x8000));
            w.set_array(FieldId::OomInfo, &event.encode());
        }
        let reader = DiagnosticReader::new(
            mirrors,
            CapabilitySet {
                background_gc: true,
                segments: false,
            },
        );
        let snapshot = reader.snapshot().unwrap();
        let restored = DiagnosticSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(restored, snapshot);

        for source in [&reader as &dyn FieldSource, &restored as &dyn FieldSource] {
            let count = source.read(0, "segment_count", TypeTag::Size).unwrap();
            assert_eq!(count.as_scalar().unwrap(), 3);
            let sweep = source.read(0, "next_sweep_obj", TypeTag::Address).unwrap();
            assert_eq!(sweep.as_pointer().unwrap(), Address(0x8000));
            let seg = source
                .read(0, "saved_sweep_ephemeral_seg", TypeTag::SegmentRef)
                .unwrap();
            assert!(seg.is_missing());
            let events = source.oom_events(0).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].requested_size, 4096);
        }
    }

    #[test]
    fn test_older_snapshot_reports_appended_fields_missing() {
        let snapshot = DiagnosticSnapshot {
            version: 1,
            capabilities: CapabilitySet::default(),
            taken_at: Utc::now(),
            heaps: vec![HeapSnapshot::default()],
        };
        let reading = snapshot.read(0, "gc_index", TypeTag::Size).unwrap();
        assert!(reading.is_missing());
    }
}
