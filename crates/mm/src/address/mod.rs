//! 地址模块
//!
//! 提供物理/虚拟地址与页号的强类型抽象，避免在内存管理代码中混用裸 `usize`。
//!
//! # 地址
//!
//! - [`Paddr`] - 物理地址
//! - [`Vaddr`] - 虚拟地址
//!
//! # 页号
//!
//! - [`PageNum`] - 页号公共接口
//! - [`Ppn`] / [`Vpn`] - 物理页号 / 虚拟页号
//! - [`PageRange`] - 半开页号区间 `[start, end)`，[`PpnRange`] 与 [`VpnRange`] 为其别名
//!
//! # 操作
//!
//! - [`UsizeConvert`] - 与 `usize` 互转
//! - [`AlignOps`] - 页对齐相关操作

mod page_num;
mod types;

pub use page_num::{PageNum, PageRange, PageRangeIter, Ppn, PpnRange, Vpn, VpnRange};
pub use types::{AlignOps, Paddr, UsizeConvert, Vaddr};

/// 当前配置的页大小
#[inline]
pub(crate) fn page_size() -> usize {
    crate::mm_config().page_size()
}
