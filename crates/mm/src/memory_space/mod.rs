//! 内存空间模块
//!
//! 一个进程的地址空间由页表和一组互不重叠的区域（[`Region`]）组成。每个区域
//! 通过 [`ObjectRef`] 引用一个后备对象（[`BackingObject`]），页面在首次访问时
//! 由缺页处理按需填充。

mod backing_object;
mod fault;
mod region;
mod region_set;
mod space;
mod tlb;

pub use backing_object::{BackingObject, ObjectKind, ObjectRef, PageState};
pub use fault::{FaultOutcome, FaultState};
pub use region::{AccessKind, MemPerm, Region, RegionInfo, ShareMode};
pub use region_set::{RegionId, RegionSet};
pub use space::{AddressSpace, MapRequest};
pub use tlb::TlbBatch;
