//! 页表内部结构模块
//!
//! 本模块定义了页表的内部接口，供不同架构的页表实现使用。
//!
//! ## 设计要点
//!
//! - `PageTableInner` 由各架构实现（例如不同 MMU、不同页表格式）。
//! - 上层（如 [`crate::memory_space::AddressSpace`]）只依赖该 trait，
//!   从而实现“地址空间管理逻辑”与“页表硬件细节”的解耦。
//! - 页表只处理 4K 叶子映射；中间级页表帧由页表自身持有，随页表一起释放。
//! - 接口本身不刷新 TLB，调用者通过 [`crate::memory_space::TlbBatch`] 统一处理。
use alloc::sync::Arc;

use super::{PageTableEntry, PagingResult, UniversalPTEFlag};
use crate::address::{Paddr, PageNum, Ppn, UsizeConvert, AlignOps, Vaddr, Vpn};
use crate::frame_allocator::FrameAllocator;

/// 页表内部接口
///
/// 此 trait 定义了页表的核心操作，由具体架构实现。
pub trait PageTableInner: Send + Sized {
    /// 页表项类型
    type Entry: PageTableEntry;

    /// 页表级数
    const LEVELS: usize;
    /// 最大虚拟地址位数
    const MAX_VA_BITS: usize;

    /// 创建新页表，页表帧从 `frames` 分配
    fn new(frames: &Arc<FrameAllocator>) -> PagingResult<Self>;

    /// 获取根页表的 PPN
    fn root_ppn(&self) -> Ppn;

    /// 获取叶子级页表项（中间级缺失时返回 `None`）
    fn get_entry(&self, vpn: Vpn) -> Option<Self::Entry>;

    /// 映射虚拟页到物理页，已存在有效映射时返回 `AlreadyMapped`
    fn map(&mut self, vpn: Vpn, ppn: Ppn, flags: UniversalPTEFlag) -> PagingResult<()>;

    /// 解除映射，返回原先映射的物理页号
    fn unmap(&mut self, vpn: Vpn) -> PagingResult<Ppn>;

    /// 移动映射：将已映射的虚拟页改为指向 `target_ppn`
    fn mvmap(&mut self, vpn: Vpn, target_ppn: Ppn, flags: UniversalPTEFlag) -> PagingResult<()>;

    /// 更新映射标志
    fn update_flags(&mut self, vpn: Vpn, flags: UniversalPTEFlag) -> PagingResult<()>;

    /// 遍历页表获取映射信息
    fn walk(&self, vpn: Vpn) -> PagingResult<(Ppn, UniversalPTEFlag)>;

    /// 翻译虚拟地址到物理地址
    fn translate(&self, vaddr: Vaddr) -> Option<Paddr> {
        let (ppn, _) = self.walk(Vpn::from_addr_floor(vaddr)).ok()?;
        Some(Paddr::from_usize(ppn.start_addr().as_usize() + vaddr.page_offset()))
    }
}
