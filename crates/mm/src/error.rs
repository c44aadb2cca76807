//! 内存管理错误类型

use core::fmt;

use crate::page_table::PagingError;

/// 内存管理操作的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// 参数非法：零长度、未对齐、标志组合非法等
    InvalidArgument,
    /// 物理帧或地址空间耗尽
    OutOfMemory,
    /// 操作范围不完整地被映射覆盖
    InvalidRange,
    /// 访问了未映射地址或违反了区域权限
    SegmentationFault,
    /// 文件读写失败
    IoFailure,
    /// 请求的权限超出文件打开方式所允许的范围
    PermissionDenied,
}

impl MmError {
    /// 转换为系统调用返回的负 errno
    pub fn to_errno(self) -> isize {
        use uapi::errno::*;
        match self {
            MmError::InvalidArgument => -EINVAL,
            MmError::OutOfMemory => -ENOMEM,
            MmError::InvalidRange => -ENOMEM,
            MmError::SegmentationFault => -EFAULT,
            MmError::IoFailure => -EIO,
            MmError::PermissionDenied => -EACCES,
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MmError::InvalidArgument => "invalid argument",
            MmError::OutOfMemory => "out of memory",
            MmError::InvalidRange => "range not fully mapped",
            MmError::SegmentationFault => "segmentation fault",
            MmError::IoFailure => "I/O failure",
            MmError::PermissionDenied => "permission denied",
        };
        f.write_str(msg)
    }
}

impl From<PagingError> for MmError {
    fn from(err: PagingError) -> Self {
        match err {
            PagingError::FrameAllocFailed => MmError::OutOfMemory,
            PagingError::NotMapped | PagingError::AlreadyMapped => MmError::InvalidRange,
            PagingError::InvalidAddress | PagingError::InvalidFlags => MmError::InvalidArgument,
        }
    }
}

/// 内存管理操作结果
pub type MmResult<T> = Result<T, MmError>;
