//! TLB 批处理
//!
//! 页表项被清除或降权后，旧翻译可能仍缓存在各 CPU 的 TLB 中。
//! 在失效完成之前，原先映射的帧不能回到分配器，否则另一个 CPU
//! 仍可能通过陈旧翻译访问已被复用的物理页。
//!
//! [`TlbBatch`] 收集本次操作涉及的虚拟页以及被退役的帧和区域，
//! 在 [`TlbBatch::flush`]（或 drop）时先发出 TLB 失效，再释放退役对象。

use alloc::vec::Vec;

use super::region::Region;
use crate::address::{Ppn, Vpn};
use crate::arch_ops::arch_ops;
use crate::frame_allocator::FrameTracker;

/// 超过该页数时改为整体刷新
const FULL_FLUSH_THRESHOLD: usize = 32;

/// 一次地址空间操作的 TLB 失效批次
pub struct TlbBatch {
    root: Ppn,
    pages: Vec<Vpn>,
    retired_frames: Vec<FrameTracker>,
    retired_regions: Vec<Region>,
}

impl TlbBatch {
    /// 为根页表为 `root` 的地址空间创建批次
    pub fn new(root: Ppn) -> Self {
        Self {
            root,
            pages: Vec::new(),
            retired_frames: Vec::new(),
            retired_regions: Vec::new(),
        }
    }

    /// 记录一个需要失效的虚拟页
    pub fn add_page(&mut self, vpn: Vpn) {
        self.pages.push(vpn);
    }

    /// 延迟释放帧，直到失效完成
    pub fn retire_frames(&mut self, frames: impl IntoIterator<Item = FrameTracker>) {
        self.retired_frames.extend(frames);
    }

    /// 延迟释放区域（及其后备对象引用），直到失效完成
    pub fn retire_region(&mut self, region: Region) {
        self.retired_regions.push(region);
    }

    /// 发出 TLB 失效，然后释放所有退役对象
    pub fn flush(&mut self) {
        if !self.pages.is_empty() {
            let ops = arch_ops();
            if self.pages.len() > FULL_FLUSH_THRESHOLD {
                ops.flush_tlb_all(self.root);
            } else {
                for &vpn in &self.pages {
                    ops.flush_tlb_page(self.root, vpn);
                }
            }
            if ops.num_cpus() > 1 {
                ops.send_tlb_shootdown(self.root);
            }
            log::trace!("tlb: flushed {} pages of {:?}", self.pages.len(), self.root);
            self.pages.clear();
        }
        self.retired_frames.clear();
        self.retired_regions.clear();
    }
}

impl Drop for TlbBatch {
    fn drop(&mut self) {
        self.flush();
    }
}
