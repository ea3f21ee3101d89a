//! 句柄表：强引用根、固定句柄与弱句柄

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::object::Address;

/// 句柄标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u32);

/// 句柄种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    /// 强引用：作为根
    Strong,
    /// 固定：作为根且目标不可移动
    Pinned,
    /// 弱引用：不是根，目标死亡后清空
    Weak,
}

#[derive(Debug, Clone, Copy)]
struct HandleSlot {
    kind: HandleKind,
    target: Address,
}

/// 句柄表
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Option<HandleSlot>>,
    free: Vec<u32>,
}

impl HandleTable {
    /// 新建
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建句柄
    pub fn create(&mut self, kind: HandleKind, target: Address) -> HandleId {
        let slot = Some(HandleSlot { kind, target });
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                HandleId(idx)
            }
            None => {
                self.slots.push(slot);
                HandleId(self.slots.len() as u32 - 1)
            }
        }
    }

    fn slot(&self, id: HandleId) -> GcResult<&HandleSlot> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(GcError::InvalidHandle(id.0))
    }

    /// 释放句柄
    pub fn free(&mut self, id: HandleId) -> GcResult<()> {
        self.slot(id)?;
        self.slots[id.0 as usize] = None;
        self.free.push(id.0);
        Ok(())
    }

    /// 目标；弱句柄的目标死亡后为 `None`
    pub fn target(&self, id: HandleId) -> GcResult<Option<Address>> {
        let slot = self.slot(id)?;
        Ok((!slot.target.is_null()).then_some(slot.target))
    }

    /// 句柄种类
    pub fn kind(&self, id: HandleId) -> GcResult<HandleKind> {
        Ok(self.slot(id)?.kind)
    }

    /// 修改目标
    pub fn set_target(&mut self, id: HandleId, target: Address) -> GcResult<()> {
        self.slot(id)?;
        if let Some(slot) = self.slots[id.0 as usize].as_mut() {
            slot.target = target;
        }
        Ok(())
    }

    fn live_slots(&self) -> impl Iterator<Item = &HandleSlot> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| !s.target.is_null())
    }

    /// 根：强句柄与固定句柄的目标
    pub fn roots(&self) -> Vec<Address> {
        self.live_slots()
            .filter(|s| s.kind != HandleKind::Weak)
            .map(|s| s.target)
            .collect()
    }

    /// 被固定句柄钉住的对象
    pub fn pinned_targets(&self) -> HashSet<Address> {
        self.live_slots()
            .filter(|s| s.kind == HandleKind::Pinned)
            .map(|s| s.target)
            .collect()
    }

    /// 清空目标已死亡的弱句柄，返回清空数量
    pub fn clear_dead_weak<F>(&mut self, is_live: F) -> usize
    where
        F: Fn(Address) -> bool,
    {
        let mut cleared = 0;
        for slot in self.slots.iter_mut().flatten() {
            if slot.kind == HandleKind::Weak && !slot.target.is_null() && !is_live(slot.target) {
                slot.target = Address::NULL;
                cleared += 1;
            }
        }
        cleared
    }

    /// 压缩后更新目标
    pub fn relocate(&mut self, forwarding: &HashMap<Address, Address>) {
        for slot in self.slots.iter_mut().flatten() {
            if let Some(&to) = forwarding.get(&slot.target) {
                slot.target = to;
            }
        }
    }

    /// 所有非空目标（含弱句柄）
    pub fn all_targets(&self) -> Vec<Address> {
        self.live_slots().map(|s| s.target).collect()
    }

    /// 存活句柄数量
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
