//! 虚拟内存子系统
//!
//! 提供地址抽象、物理帧分配、页表管理、地址空间与缺页处理。
//!
//! # 组成
//!
//! - [`FrameAllocator`]：位图帧分配器，帧以带引用计数的 [`FrameTracker`] 交出
//! - [`BackingObject`]：匿名或文件后备的页槽集合，按需填充，支持写时复制
//! - [`Region`] / [`AddressSpace`]：进程地址空间中的区域及其 mmap/munmap/mprotect
//! - [`AddressSpace::handle_page_fault`]：缺页处理
//! - [`MemoryManager`]：按地址空间标识对外提供上述操作
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与架构特定组件解耦：
//! - [`ArchMmOps`]: 地址转换、TLB 操作
//! - [`MmConfig`]: 内存布局常量
//! - [`MmFile`] / [`MmInode`]: 文件映射所需的文件系统接口
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_config`] 注册实现。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch_ops;
mod config;
mod error;
mod file;
mod manager;

pub mod address;
pub mod frame_allocator;
pub mod memory_space;
pub mod page_table;

#[cfg(test)]
mod test_utils;

pub use arch_ops::{arch_ops, register_arch_ops, ArchMmOps};
pub use config::{mm_config, register_config, MmConfig};
pub use error::{MmError, MmResult};
pub use file::{MmFile, MmInode};
pub use manager::{init_memory_manager, memory_manager, Asid, MemoryManager, SpaceHandle};

// Re-export 常用类型
pub use address::{AlignOps, PageNum, Paddr, Ppn, PpnRange, UsizeConvert, Vaddr, Vpn, VpnRange};
pub use frame_allocator::{FrameAllocator, FrameStats, FrameTracker};
pub use memory_space::{
    AccessKind, AddressSpace, BackingObject, FaultOutcome, FaultState, MapRequest, MemPerm,
    ObjectKind, ObjectRef, Region, RegionInfo, ShareMode, TlbBatch,
};
pub use page_table::{
    PageTableEntry, PageTableInner, PagingError, PagingResult, Sv39PageTable, UniversalPTEFlag,
};
