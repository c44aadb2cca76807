//! 内存映射相关的用户态接口定义
//!
//! 对应 Linux 的 `mman.h`：`mmap`/`mprotect` 的保护位、`mmap` 的映射标志以及 `msync` 标志。

use bitflags::bitflags;

bitflags! {
    /// `mmap`/`mprotect` 的保护标志（`PROT_*`）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl ProtFlags {
    /// `PROT_NONE`：不可访问
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// `mmap` 的映射标志（`MAP_*`）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
        const NORESERVE = 0x4000;
        const POPULATE = 0x8000;
    }
}

impl MapFlags {
    /// 共享类型掩码（`MAP_TYPE`）
    pub const TYPE_MASK: Self = Self::SHARED.union(Self::PRIVATE);
}

bitflags! {
    /// `msync` 标志（`MS_*`）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsyncFlags: u32 {
        const ASYNC = 0x1;
        const INVALIDATE = 0x2;
        const SYNC = 0x4;
    }
}

/// `mmap` 失败时返回给用户态的地址值
pub const MAP_FAILED: usize = usize::MAX;
