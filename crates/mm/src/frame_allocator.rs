//! 帧分配器模块
//!
//! 本模块提供物理内存帧的分配、引用计数和内容访问。
//!
//! ## 分配策略（位图）
//!
//! 分配器使用位图（bitmap）跟踪每个物理帧的分配状态：
//!
//! - **bitmap**：每个 bit 表示一个物理帧（0=空闲，1=已分配）
//! - **refcounts**：每个帧被多少个 [`FrameTracker`] 引用
//! - **last_alloc_hint**：上次分配位置提示，利用局部性加速查找
//!
//! 分配时从 last_alloc_hint 开始按 u64 循环查找第一个空闲位，
//! 引用计数降为 0 时清除对应 bit。
//!
//! ## RAII：引用计数
//!
//! [`FrameTracker`] 是一个物理帧的计数引用：`Clone` 增加引用计数，
//! `Drop` 减少引用计数，降为 0 时帧回到空闲池。多个后备对象在
//! 写时复制之前共享同一帧，正是通过持有各自的 `FrameTracker` 实现。
//!
//! 分配器以 `Arc` 共享，每个 `FrameTracker` 都持有它的句柄，
//! 因此帧总是归还给分配出它的那个分配器。

use core::fmt;

use crate::address::{AlignOps, Paddr, PageNum, Ppn, UsizeConvert};
use crate::error::{MmError, MmResult};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use sync::SpinLock;

// ============================================================================
// FrameTracker - 单帧计数引用
// ============================================================================

/// 物理帧跟踪器。
///
/// 持有一个物理帧的引用计数。克隆时计数加一，drop 时减一，
/// 最后一个引用消失时帧被回收。
pub struct FrameTracker {
    ppn: Ppn,
    allocator: Arc<FrameAllocator>,
}

impl FrameTracker {
    /// 获取此帧跟踪器所管理的物理页号 (Ppn)。
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }

    /// 帧的物理起始地址
    pub fn paddr(&self) -> Paddr {
        self.ppn.start_addr()
    }

    /// 当前引用计数
    pub fn ref_count(&self) -> usize {
        self.allocator.ref_count(self.ppn)
    }

    /// 从页内 `offset` 处读出 `buf.len()` 字节
    ///
    /// # Panics
    /// 越过页边界时 panic
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= page_size(), "read_bytes: out of frame");
        // SAFETY: 帧由本跟踪器持有引用，直接映射区覆盖整个页
        unsafe {
            core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// 向页内 `offset` 处写入 `data`
    ///
    /// # Panics
    /// 越过页边界时 panic
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= page_size(), "write_bytes: out of frame");
        // SAFETY: 同 read_bytes
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
    }

    /// 以 `other` 的内容覆盖本帧
    pub fn copy_from(&self, other: &FrameTracker) {
        if self.ppn == other.ppn {
            return;
        }
        // SAFETY: 两个不同的帧各自有效且不重叠
        unsafe {
            core::ptr::copy_nonoverlapping(other.as_ptr(), self.as_ptr(), page_size());
        }
    }

    /// 将整个帧清零
    pub fn zero(&self) {
        self.fill(0);
    }

    /// 将 `[offset, page_size)` 用 `byte` 填充
    pub fn fill_from(&self, offset: usize, byte: u8) {
        let page = page_size();
        if offset >= page {
            return;
        }
        // SAFETY: 范围位于本帧内
        unsafe {
            core::ptr::write_bytes(self.as_ptr().add(offset), byte, page - offset);
        }
    }

    fn fill(&self, byte: u8) {
        self.fill_from(0, byte);
    }

    /// 以可变切片方式访问整个帧
    ///
    /// 仅当调用者是该帧唯一的引用者时使用（刚分配、尚未发布的帧）。
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.ref_count(), 1, "as_mut_slice on shared frame");
        // SAFETY: 唯一引用，生命周期与 &mut self 绑定
        unsafe { core::slice::from_raw_parts_mut(self.as_ptr(), page_size()) }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.paddr().to_kernel_vaddr().as_usize() as *mut u8
    }
}

impl Clone for FrameTracker {
    fn clone(&self) -> Self {
        self.allocator.retain(self.ppn);
        Self {
            ppn: self.ppn,
            allocator: self.allocator.clone(),
        }
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        self.allocator.release(self.ppn);
    }
}

impl fmt::Debug for FrameTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameTracker").field(&self.ppn).finish()
    }
}

impl PartialEq for FrameTracker {
    fn eq(&self, other: &Self) -> bool {
        self.ppn == other.ppn && Arc::ptr_eq(&self.allocator, &other.allocator)
    }
}

impl Eq for FrameTracker {}

fn page_size() -> usize {
    crate::mm_config().page_size()
}

// ============================================================================
// 帧分配器
// ============================================================================

/// 分配器统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// 总帧数
    pub total: usize,
    /// 已分配帧数
    pub allocated: usize,
    /// 空闲帧数
    pub free: usize,
}

/// 物理帧分配器。
///
/// 内部状态由自旋锁保护，所有方法都可以并发调用。
pub struct FrameAllocator {
    inner: SpinLock<BitmapInner>,
}

/// 位图状态
struct BitmapInner {
    /// 物理帧的起始 Ppn。
    start: Ppn,
    /// 位图数据（每个 bit 表示一个帧：0=空闲，1=已分配）。
    bitmap: Vec<u64>,
    /// 每帧引用计数，空闲帧为 0。
    refcounts: Vec<u32>,
    /// 总帧数。
    total_frames: usize,
    /// 已分配帧数（用于快速统计）。
    allocated_count: usize,
    /// 上次分配的位置提示（u64 下标）。
    last_alloc_hint: usize,
}

impl BitmapInner {
    #[inline]
    fn index_of(&self, ppn: Ppn) -> Option<usize> {
        let idx = ppn.as_usize().checked_sub(self.start.as_usize())?;
        (idx < self.total_frames).then_some(idx)
    }

    #[inline]
    fn mark_allocated(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / 64] |= 1u64 << (frame_idx % 64);
    }

    #[inline]
    fn mark_free(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / 64] &= !(1u64 << (frame_idx % 64));
    }

    /// 从 last_alloc_hint 开始循环查找第一个空闲位。
    fn alloc_index(&mut self) -> Option<usize> {
        let bitmap_len = self.bitmap.len();
        for offset in 0..bitmap_len {
            let idx = (self.last_alloc_hint + offset) % bitmap_len;
            let word = self.bitmap[idx];

            // 快速跳过全满的 u64
            if word == u64::MAX {
                continue;
            }

            let frame_idx = idx * 64 + (!word).trailing_zeros() as usize;
            // 最后一个 u64 的高位不对应真实帧
            if frame_idx >= self.total_frames {
                continue;
            }

            self.mark_allocated(frame_idx);
            self.refcounts[frame_idx] = 1;
            self.allocated_count += 1;
            self.last_alloc_hint = idx;
            return Some(frame_idx);
        }
        None
    }
}

impl FrameAllocator {
    /// 用 `[start_addr, end_addr)` 范围内的物理内存创建分配器。
    ///
    /// 起始地址向上、结束地址向下对齐到页边界。
    pub fn new(start_addr: usize, end_addr: usize) -> Arc<Self> {
        let start = Paddr::new(start_addr)
            .align_up_to_page()
            .map(Ppn::from_addr_floor)
            .unwrap_or(Ppn(usize::MAX));
        let end = Ppn::from_addr_floor(Paddr::new(end_addr));
        let total_frames = end.as_usize().saturating_sub(start.as_usize());

        log::debug!(
            "frame allocator: {:?}..{:?} ({} frames)",
            start,
            end,
            total_frames
        );

        Arc::new(Self {
            inner: SpinLock::new(BitmapInner {
                start,
                bitmap: vec![0u64; total_frames.div_ceil(64)],
                refcounts: vec![0u32; total_frames],
                total_frames,
                allocated_count: 0,
                last_alloc_hint: 0,
            }),
        })
    }

    /// 分配一个物理帧，内容为先前的任意数据。
    pub fn allocate(self: &Arc<Self>) -> MmResult<FrameTracker> {
        let mut inner = self.inner.lock();
        match inner.alloc_index() {
            Some(idx) => Ok(FrameTracker {
                ppn: inner.start.add(idx),
                allocator: self.clone(),
            }),
            None => {
                log::warn!("frame allocator: out of memory");
                Err(MmError::OutOfMemory)
            }
        }
    }

    /// 分配一个内容全为 0 的物理帧。
    pub fn allocate_zeroed(self: &Arc<Self>) -> MmResult<FrameTracker> {
        let frame = self.allocate()?;
        frame.zero();
        Ok(frame)
    }

    /// 增加帧的引用计数。
    pub fn retain(&self, ppn: Ppn) {
        let mut inner = self.inner.lock();
        match inner.index_of(ppn) {
            Some(idx) if inner.refcounts[idx] > 0 => inner.refcounts[idx] += 1,
            _ => {
                log::error!("frame allocator: retain of free frame {:?}", ppn);
                debug_assert!(false, "retain of free frame {:?}", ppn);
            }
        }
    }

    /// 减少帧的引用计数，降为 0 时回收。
    pub fn release(&self, ppn: Ppn) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.index_of(ppn).filter(|&i| inner.refcounts[i] > 0) else {
            log::error!("frame allocator: double free of {:?}", ppn);
            debug_assert!(false, "double free detected: {:?}", ppn);
            return;
        };
        inner.refcounts[idx] -= 1;
        if inner.refcounts[idx] == 0 {
            inner.mark_free(idx);
            inner.allocated_count -= 1;
        }
    }

    /// 帧的当前引用计数，空闲帧或范围外的帧为 0。
    pub fn ref_count(&self, ppn: Ppn) -> usize {
        let inner = self.inner.lock();
        inner
            .index_of(ppn)
            .map_or(0, |idx| inner.refcounts[idx] as usize)
    }

    /// 获取总的物理帧数
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }

    /// 获取已分配的帧数
    pub fn allocated_frames(&self) -> usize {
        self.inner.lock().allocated_count
    }

    /// 获取空闲的帧数
    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.total_frames - inner.allocated_count
    }

    /// 获取帧分配器的当前状态
    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total: inner.total_frames,
            allocated: inner.allocated_count,
            free: inner.total_frames - inner.allocated_count,
        }
    }
}
