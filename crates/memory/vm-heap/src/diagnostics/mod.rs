//! 诊断导出
//!
//! 面向进程外工具的只读字段目录。读者按名称和期望类型读取字段，
//! 活进程通过 [`DiagnosticReader`] 无锁读取，静态快照通过
//! [`DiagnosticSnapshot`] 读取，两者实现同一个 [`FieldSource`] 接口。

pub mod catalogue;
pub mod mirror;
pub mod snapshot;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::object::Address;
use crate::oom::OomEvent;

pub use catalogue::{
    CATALOGUE, CATALOGUE_VERSION, Capability, CapabilitySet, FieldDescriptor, FieldId, FieldShape,
    MAX_INTERNAL_ROOTS, TypeTag,
};
pub use mirror::{DiagnosticMirror, MirrorWriter};
pub use snapshot::DiagnosticSnapshot;

/// 字段值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 当前配置下不存在
    Missing,
    /// 数值
    Scalar(u64),
    /// 布尔
    Flag(bool),
    /// 地址或指针
    Pointer(Address),
    /// 数组
    Array(Vec<u64>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Missing => "missing",
            FieldValue::Scalar(_) => "scalar",
            FieldValue::Flag(_) => "flag",
            FieldValue::Pointer(_) => "pointer",
            FieldValue::Array(_) => "array",
        }
    }

    pub(crate) fn decode(descriptor: &FieldDescriptor, words: Vec<u64>) -> Self {
        let first = words.first().copied().unwrap_or(0);
        match (descriptor.shape, descriptor.type_tag) {
            (FieldShape::FixedArray(_) | FieldShape::VarArray { .. }, _) => FieldValue::Array(words),
            (FieldShape::Pointer, _) | (FieldShape::Direct, TypeTag::Address) => {
                FieldValue::Pointer(Address(first as usize))
            }
            (FieldShape::Direct, TypeTag::Bool) => FieldValue::Flag(first != 0),
            (FieldShape::Direct, _) => FieldValue::Scalar(first),
        }
    }
}

/// 读取稳定性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    /// 稳定
    Stable,
    /// 读取时相关结构正在变化
    InProgress,
}

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReading {
    /// 字段名
    pub name: &'static str,
    /// 值
    pub value: FieldValue,
    /// 稳定性
    pub stability: Stability,
}

impl FieldReading {
    /// 是否缺失
    pub fn is_missing(&self) -> bool {
        self.value == FieldValue::Missing
    }

    fn mismatch(&self, expected: &str) -> GcError {
        match self.value {
            FieldValue::Missing => GcError::DiagnosticFieldMissing(self.name.to_string()),
            _ => GcError::DiagnosticTypeMismatch {
                name: self.name.to_string(),
                expected: expected.to_string(),
                actual: self.value.kind().to_string(),
            },
        }
    }

    /// 数值
    pub fn as_scalar(&self) -> GcResult<u64> {
        match self.value {
            FieldValue::Scalar(v) => Ok(v),
            _ => Err(self.mismatch("scalar")),
        }
    }

    /// 布尔
    pub fn as_flag(&self) -> GcResult<bool> {
        match self.value {
            FieldValue::Flag(v) => Ok(v),
            _ => Err(self.mismatch("flag")),
        }
    }

    /// 地址
    pub fn as_pointer(&self) -> GcResult<Address> {
        match self.value {
            FieldValue::Pointer(v) => Ok(v),
            _ => Err(self.mismatch("pointer")),
        }
    }

    /// 数组
    pub fn as_array(&self) -> GcResult<&[u64]> {
        match &self.value {
            FieldValue::Array(v) => Ok(v),
            _ => Err(self.mismatch("array")),
        }
    }
}

/// 诊断字段来源：活进程或快照
pub trait FieldSource {
    /// 来源的目录版本
    fn catalogue_version(&self) -> u32;

    /// 能力集合
    fn capabilities(&self) -> CapabilitySet;

    /// 逻辑堆数量
    fn heap_count(&self) -> usize;

    /// 读取已确认可用的字段
    fn read_slot(&self, heap: usize, descriptor: &FieldDescriptor) -> GcResult<(FieldValue, Stability)>;

    /// 按名称和期望类型读取
    fn read(&self, heap: usize, name: &str, expected: TypeTag) -> GcResult<FieldReading> {
        let descriptor =
            catalogue::lookup(name).ok_or_else(|| GcError::UnknownDiagnosticField(name.to_string()))?;
        if descriptor.type_tag != expected {
            return Err(GcError::DiagnosticTypeMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual: descriptor.type_tag.to_string(),
            });
        }
        if heap >= self.heap_count() {
            return Err(GcError::InvalidHeap(heap));
        }
        if descriptor.since > self.catalogue_version()
            || !self.capabilities().satisfies(descriptor.requires)
        {
            return Ok(FieldReading {
                name: descriptor.name,
                value: FieldValue::Missing,
                stability: Stability::Stable,
            });
        }
        let (value, stability) = self.read_slot(heap, descriptor)?;
        Ok(FieldReading {
            name: descriptor.name,
            value,
            stability,
        })
    }

    /// 解码 OOM 历史（从旧到新）
    fn oom_events(&self, heap: usize) -> GcResult<Vec<OomEvent>> {
        let reading = self.read(heap, "oom_info", TypeTag::OomEvent)?;
        let words = reading.as_array()?;
        Ok(words
            .chunks(OomEvent::WORDS)
            .filter_map(OomEvent::decode)
            .collect())
    }
}

/// 活进程的无锁读者
#[derive(Debug, Clone)]
pub struct DiagnosticReader {
    mirrors: Arc<[DiagnosticMirror]>,
    capabilities: CapabilitySet,
}

impl DiagnosticReader {
    pub(crate) fn new(mirrors: Arc<[DiagnosticMirror]>, capabilities: CapabilitySet) -> Self {
        Self {
            mirrors,
            capabilities,
        }
    }

    /// 拍摄快照
    pub fn snapshot(&self) -> GcResult<DiagnosticSnapshot> {
        DiagnosticSnapshot::capture(self)
    }
}

impl FieldSource for DiagnosticReader {
    fn catalogue_version(&self) -> u32 {
        CATALOGUE_VERSION
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn heap_count(&self) -> usize {
        self.mirrors.len()
    }

    fn read_slot(&self, heap: usize, descriptor: &FieldDescriptor) -> GcResult<(FieldValue, Stability)> {
        let mirror = self.mirrors.get(heap).ok_or(GcError::InvalidHeap(heap))?;
        let (words, consistent) = mirror.load(descriptor.id);
        let stability = if !consistent || (descriptor.volatile && mirror.cycle_active()) {
            Stability::InProgress
        } else {
            Stability::Stable
        };
        Ok((FieldValue::decode(descriptor, words), stability))
    }
}
