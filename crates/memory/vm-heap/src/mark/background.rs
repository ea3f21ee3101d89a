//! 后台标记
//!
//! 后台线程在对象空间的读锁下按块追踪，块之间释放锁让赋值器继续运行。
//! 周期开始后分配在边界内的对象立即置位（allocate-black），边界外的对象
//! 视为存活。赋值器的引用写入由写监视表记录，最终暂停时重新扫描。

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::MarkPhase;
use super::bitmap::MarkBitmap;
use crate::card_table::CardTable;
use crate::object::{Address, ObjectSpace};

/// 周期开始时保存的最低/最高地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundBounds {
    /// 最低地址（含）
    pub low: Address,
    /// 最高地址（不含）
    pub high: Address,
}

impl BackgroundBounds {
    /// 是否在边界内
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// 后台线程与回收器共享的状态
#[derive(Debug)]
pub struct BackgroundShared {
    bitmap: MarkBitmap,
    bounds: BackgroundBounds,
    worklist: Mutex<Vec<Address>>,
    abort: AtomicBool,
    finished: AtomicBool,
    phase: AtomicU8,
    traced: AtomicU64,
}

impl BackgroundShared {
    /// 以根集合初始化
    pub fn new(bounds: BackgroundBounds, roots: Vec<Address>) -> Self {
        Self {
            bitmap: MarkBitmap::new(bounds.low, bounds.high),
            bounds,
            worklist: Mutex::new(roots),
            abort: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            phase: AtomicU8::new(MarkPhase::MarkRoots as u8),
            traced: AtomicU64::new(0),
        }
    }

    /// 边界
    pub fn bounds(&self) -> BackgroundBounds {
        self.bounds
    }

    /// 位图
    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    /// 当前阶段
    pub fn phase(&self) -> MarkPhase {
        MarkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// 切换阶段
    pub fn set_phase(&self, phase: MarkPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// 请求取消
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// 是否已请求取消
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// 并发追踪是否已结束
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 已追踪对象数
    pub fn traced(&self) -> u64 {
        self.traced.load(Ordering::Relaxed)
    }

    /// 本周期内对象是否视为存活
    #[inline]
    pub fn is_live(&self, addr: Address) -> bool {
        !self.bounds.contains(addr) || self.bitmap.is_marked(addr)
    }

    /// 新分配对象：边界内立即置位
    #[inline]
    pub fn allocate_black(&self, addr: Address) {
        if self.bounds.contains(addr) {
            self.bitmap.set(addr);
        }
    }

    fn trace_one(&self, space: &ObjectSpace, addr: Address, out: &mut Vec<Address>) {
        if !self.bounds.contains(addr) {
            return;
        }
        let Some(record) = space.get(addr) else {
            return;
        };
        if self.bitmap.set(addr) {
            self.traced.fetch_add(1, Ordering::Relaxed);
            out.extend(record.references());
        }
    }

    /// 最终暂停：重新扫描根与写监视卡片，并在暂停中追踪到闭包
    pub fn finish_under_pause(
        &self,
        space: &ObjectSpace,
        roots: &[Address],
        watch: &CardTable,
        ranges: &[(Address, Address)],
    ) -> usize {
        let mut stack: Vec<Address> = std::mem::take(&mut *self.worklist.lock());
        stack.extend_from_slice(roots);

        let mut rescanned = 0;
        for &(start, end) in ranges {
            for idx in watch.dirty_cards_in(start, end) {
                let (card_start, card_end) = watch.card_bounds(idx);
                for addr in space.overlapping(card_start, card_end) {
                    if !self.is_live(addr) {
                        continue;
                    }
                    if let Some(record) = space.get(addr) {
                        stack.extend(record.references());
                    }
                }
                rescanned += 1;
            }
        }

        self.trace_to_closure(space, stack);
        rescanned
    }

    /// 在调用者持有的对象空间视图上追踪到闭包
    pub fn trace_to_closure(&self, space: &ObjectSpace, mut stack: Vec<Address>) {
        while let Some(addr) = stack.pop() {
            self.trace_one(space, addr, &mut stack);
        }
    }
}

/// 启动后台追踪线程
pub fn spawn_tracer(
    shared: Arc<BackgroundShared>,
    space: Arc<RwLock<ObjectSpace>>,
    chunk: usize,
) -> io::Result<JoinHandle<()>> {
    shared.set_phase(MarkPhase::Trace);
    thread::Builder::new()
        .name("gc-background-mark".into())
        .spawn(move || trace_loop(&shared, &space, chunk))
}

fn trace_loop(shared: &BackgroundShared, space: &RwLock<ObjectSpace>, chunk: usize) {
    loop {
        if shared.is_aborted() {
            log::debug!("background mark observed abort request");
            return;
        }
        let batch = {
            let mut worklist = shared.worklist.lock();
            let keep = worklist.len().saturating_sub(chunk);
            worklist.split_off(keep)
        };
        if batch.is_empty() {
            shared.finished.store(true, Ordering::Release);
            return;
        }

        let mut found = Vec::new();
        {
            let space = space.read();
            for addr in batch {
                shared.trace_one(&space, addr, &mut found);
            }
        }
        if !found.is_empty() {
            shared.worklist.lock().extend(found);
        }
    }
}
