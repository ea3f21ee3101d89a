//! 代表与分配预算
//!
//! 每个逻辑堆为每一代维护分配预算、回收以来的分配量与占用量。
//! 回收后根据存活率调整预算：存活率越高预算越大，且不低于初始值。

use serde::{Deserialize, Serialize};

use crate::config::{GcConfig, TuningConfig};
use crate::object::Generation;

/// 单代状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationState {
    /// 代
    pub generation: Generation,
    /// 初始预算
    pub initial_budget: usize,
    /// 当前预算
    pub budget: usize,
    /// 上次回收以来的分配（含晋升进入的字节）
    pub allocated_since_gc: usize,
    /// 当前占用字节
    pub occupancy: usize,
    /// 本代被回收的次数
    pub collection_count: u64,
    /// 上次回收的存活率
    pub last_survival_rate: f64,
}

impl GenerationState {
    fn new(generation: Generation, budget: usize) -> Self {
        Self {
            generation,
            initial_budget: budget,
            budget,
            allocated_since_gc: 0,
            occupancy: 0,
            collection_count: 0,
            last_survival_rate: 0.0,
        }
    }

    /// 分配 `size` 字节后是否超出预算
    #[inline]
    pub fn would_exceed(&self, size: usize) -> bool {
        self.allocated_since_gc.saturating_add(size) > self.budget
    }

    /// 超出预算的程度（分配量 / 预算）
    pub fn pressure(&self) -> f64 {
        self.allocated_since_gc as f64 / self.budget.max(1) as f64
    }
}

/// 代表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTable {
    states: Vec<GenerationState>,
}

impl GenerationTable {
    /// 由配置创建
    pub fn new(config: &GcConfig) -> Self {
        Self {
            states: Generation::ALL
                .iter()
                .map(|&g| GenerationState::new(g, config.budget(g)))
                .collect(),
        }
    }

    /// 查询
    #[inline]
    pub fn get(&self, generation: Generation) -> &GenerationState {
        &self.states[generation.index()]
    }

    /// 可变查询
    #[inline]
    pub fn get_mut(&mut self, generation: Generation) -> &mut GenerationState {
        &mut self.states[generation.index()]
    }

    /// 当前预算
    pub fn budget(&self, generation: Generation) -> usize {
        self.get(generation).budget
    }

    /// 记录分配
    pub fn record_allocation(&mut self, generation: Generation, size: usize) {
        let state = self.get_mut(generation);
        state.allocated_since_gc += size;
        state.occupancy += size;
    }

    /// 记录晋升进入某代的字节（消耗该代预算）
    pub fn record_promotion(&mut self, to: Generation, size: usize) {
        let state = self.get_mut(to);
        state.allocated_since_gc += size;
        state.occupancy += size;
    }

    /// 记录回收释放的字节
    pub fn record_freed(&mut self, generation: Generation, size: usize) {
        let state = self.get_mut(generation);
        state.occupancy = state.occupancy.saturating_sub(size);
    }

    /// 需要被回收的最高代：分配目标代超出预算时触发，并向上升级到预算同样耗尽的代
    pub fn generation_to_condemn(&self, target: Generation, size: usize) -> Option<Generation> {
        if !self.get(target).would_exceed(size) {
            return None;
        }
        let mut condemned = target.condemn_tier();
        for g in [Generation::Gen1, Generation::Gen2, Generation::Large, Generation::Pinned] {
            if self.get(g).would_exceed(0) && g.condemn_tier() > condemned {
                condemned = g.condemn_tier();
            }
        }
        Some(condemned)
    }

    /// 回收结束：按存活率调整被回收代的预算并清零分配计数
    pub fn finish_collection(
        &mut self,
        condemned: Generation,
        survival: &[f64; Generation::COUNT],
        tuning: &TuningConfig,
    ) {
        for g in Generation::ALL {
            if !g.is_condemned_by(condemned) {
                continue;
            }
            let state = self.get_mut(g);
            let rate = survival[g.index()].clamp(0.0, 1.0);
            state.last_survival_rate = rate;
            state.collection_count += 1;
            state.allocated_since_gc = 0;
            state.budget = tuned_budget(state.initial_budget, rate, tuning);
        }
    }

    /// 全部状态
    pub fn states(&self) -> &[GenerationState] {
        &self.states
    }
}

/// 由存活率计算新预算
pub fn tuned_budget(initial: usize, survival_rate: f64, tuning: &TuningConfig) -> usize {
    let scaled = initial as f64 * (1.0 + tuning.survival_growth * survival_rate);
    let cap = initial as f64 * tuning.max_budget_multiplier;
    scaled.clamp(initial as f64, cap) as usize
}
