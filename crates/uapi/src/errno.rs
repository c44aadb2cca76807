//! 错误码定义
//!
//! 仅收录内存管理系统调用会返回的错误码，取值与 Linux `errno.h` 一致。

pub const EPERM: isize = 1;
pub const EIO: isize = 5;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EACCES: isize = 13;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const ENODEV: isize = 19;
pub const EINVAL: isize = 22;
pub const EOVERFLOW: isize = 75;
