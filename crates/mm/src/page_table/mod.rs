//! 页表模块
//!
//! 本模块提供与页表管理相关的功能，包括页表的创建、映射、解除映射、翻译等操作。
//! 所有页表编辑都必须在所属地址空间的锁内进行；TLB 失效由调用者批量发出。
mod page_table_entry;
mod sv39;
mod table;

pub use page_table_entry::*;
pub use sv39::Sv39PageTable;
pub use table::*;

/// 分页操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 虚拟地址未被映射
    NotMapped,
    /// 虚拟地址已被映射
    AlreadyMapped,
    /// 提供了无效的地址（超出页表可表示范围或落在大页映射中）
    InvalidAddress,
    /// 提供了无效的标志（Flags）
    InvalidFlags,
    /// 中间页表帧分配失败
    FrameAllocFailed,
}

/// 分页操作的结果类型
pub type PagingResult<T> = Result<T, PagingError>;
