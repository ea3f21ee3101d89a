//! 后台回收周期
//!
//! 开始：短暂暂停中保存边界、快照根、打开写监视并启动追踪线程。
//! 完成：最终暂停中重新扫描根与写监视卡片，追踪到闭包后清除（不压缩）。
//! 取消：通知线程退出并等待，本周期的标记结果全部丢弃。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Instant;

use super::{CollectorState, HeapManager, MechanismBit};
use crate::error::{GcError, GcResult};
use crate::mark::{BackgroundBounds, BackgroundShared, MarkPhase, background::spawn_tracer};
use crate::object::{Address, Generation, ObjectRecord};
use crate::stats::{CollectionReason, CollectionSummary};

/// 进行中的后台周期
#[derive(Debug)]
pub(crate) struct BackgroundCycle {
    pub(crate) shared: Arc<BackgroundShared>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundCycle {
    pub(crate) fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

impl HeapManager {
    /// 启动后台周期；未启用并发或已有周期时返回 `false`
    pub fn start_background_collection(&self) -> GcResult<bool> {
        if !self.config.concurrent {
            log::debug!("background collection requested but concurrent GC is disabled");
            return Ok(false);
        }
        let mut state = self.state.lock();
        if state.background.is_some() {
            return Ok(false);
        }
        self.start_background_locked(&mut state)
    }

    /// 后台周期是否进行中
    pub fn is_background_in_progress(&self) -> bool {
        self.state.lock().background.is_some()
    }

    /// 完成后台周期：等待追踪线程，然后执行最终暂停
    pub fn complete_background_collection(&self) -> GcResult<Option<CollectionSummary>> {
        let mut state = self.state.lock();
        self.complete_background_locked(&mut state)
    }

    /// 取消后台周期；返回是否确有周期被取消
    pub fn abort_background_collection(&self) -> bool {
        let mut state = self.state.lock();
        let aborted = self.abort_background_locked(&mut state, "abort requested");
        if aborted {
            self.publish(&state);
        }
        aborted
    }

    pub(crate) fn start_background_locked(&self, state: &mut CollectorState) -> GcResult<bool> {
        if !self.config.concurrent || state.background.is_some() {
            return Ok(false);
        }

        let (roots, bounds) = {
            // 短暂暂停：此后的引用写入都会被写监视表记录
            let _pause = self.space.write();
            self.write_watch.clear_all();
            self.watching.store(true, Ordering::Release);
            let bounds = state
                .heaps
                .iter()
                .filter_map(|h| h.segments.bounds())
                .reduce(|(low, high), (l, h)| (low.min(l), high.max(h)))
                .map_or(
                    BackgroundBounds {
                        low: Address::NULL,
                        high: Address::NULL,
                    },
                    |(low, high)| BackgroundBounds { low, high },
                );
            (Self::roots(state), bounds)
        };

        for heap in state.heaps.iter_mut() {
            heap.saved_sweep_ephemeral = heap
                .segments
                .ephemeral()
                .and_then(|h| heap.segments.get(h).ok())
                .map(|s| (s.start(), s.allocated()));
        }

        let shared = Arc::new(BackgroundShared::new(bounds, roots));
        match spawn_tracer(
            Arc::clone(&shared),
            Arc::clone(&self.space),
            self.config.tuning.background_chunk,
        ) {
            Ok(thread) => {
                state.sweeper.set_next_sweep_obj(bounds.low);
                state.mark.set_phase(MarkPhase::Trace);
                state.background = Some(BackgroundCycle {
                    shared,
                    thread: Some(thread),
                });
                self.publish(state);
                log::info!(
                    "background collection started over {}..{}",
                    bounds.low,
                    bounds.high
                );
                Ok(true)
            }
            Err(err) => {
                self.watching.store(false, Ordering::Release);
                for heap in state.heaps.iter_mut() {
                    heap.saved_sweep_ephemeral = None;
                }
                log::warn!("cannot spawn background mark thread ({err}), collecting synchronously");
                self.collect_locked(state, Generation::Gen2, CollectionReason::Background)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn complete_background_locked(
        &self,
        state: &mut CollectorState,
    ) -> GcResult<Option<CollectionSummary>> {
        let Some(mut cycle) = state.background.take() else {
            return Ok(None);
        };
        if let Some(thread) = cycle.take_thread()
            && thread.join().is_err()
        {
            let err = GcError::mark_aborted("background mark thread panicked");
            log::warn!("{err}, falling back to a blocking collection");
            self.discard_cycle(state);
            return self
                .collect_locked(state, Generation::Gen2, CollectionReason::Background)
                .map(Some);
        }

        let shared = cycle.shared;
        let started = Instant::now();
        shared.set_phase(MarkPhase::FinalPause);
        state.mark.set_phase(MarkPhase::FinalPause);
        state.gc_index += 1;
        let mut summary = CollectionSummary::new(state.gc_index, Generation::Gen2, CollectionReason::Background);
        summary.background = true;

        let mut space = self.space.write();
        self.watching.store(false, Ordering::Release);
        let roots = Self::roots(state);
        let ranges = Self::segment_ranges(state);
        summary.cards_scanned = shared.finish_under_pause(&space, &roots, &self.write_watch, &ranges);
        self.write_watch.clear_all();

        let mut revived = Vec::new();
        for heap in state.heaps.iter_mut() {
            revived.extend(
                heap.finalization
                    .scan_unreachable(Generation::Gen2, |a| shared.is_live(a)),
            );
        }
        summary.finalizers_ready = revived.len();
        shared.trace_to_closure(&space, revived);
        shared.set_phase(MarkPhase::Done);

        let live = |addr: Address, _: &ObjectRecord| shared.is_live(addr);
        self.reclaim(state, &mut space, Generation::Gen2, &live, false, None, &mut summary)?;
        drop(space);

        state.sweeper.set_next_sweep_obj(shared.bounds().high);
        for heap in state.heaps.iter_mut() {
            heap.saved_sweep_ephemeral = None;
        }
        summary.pause = started.elapsed();
        self.finish_collection(state, &summary);
        log::info!(
            "background collection #{} finished: {} object(s) traced, {} freed, final pause {:?}",
            summary.gc_index,
            shared.traced(),
            summary.objects_freed,
            summary.pause
        );
        Ok(Some(summary))
    }

    /// 取消进行中的周期
    pub(crate) fn abort_background_locked(&self, state: &mut CollectorState, why: &str) -> bool {
        let Some(mut cycle) = state.background.take() else {
            return false;
        };
        cycle.shared.request_abort();
        if let Some(thread) = cycle.take_thread()
            && thread.join().is_err()
        {
            log::warn!("background mark thread panicked while aborting");
        }
        self.discard_cycle(state);
        log::warn!(
            "{} after tracing {} object(s)",
            GcError::mark_aborted(why),
            cycle.shared.traced()
        );
        true
    }

    fn discard_cycle(&self, state: &mut CollectorState) {
        self.watching.store(false, Ordering::Release);
        self.write_watch.clear_all();
        state.stats.background_aborts += 1;
        state.mark.set_phase(MarkPhase::Idle);
        state.sweeper.set_next_sweep_obj(Address::NULL);
        for heap in state.heaps.iter_mut() {
            heap.counters.record_mechanism(MechanismBit::BackgroundAborted);
            heap.saved_sweep_ephemeral = None;
        }
    }
}
