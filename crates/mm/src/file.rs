//! 文件映射接口 trait 定义

use alloc::sync::Arc;

/// 可用于内存映射读写的 Inode 接口
///
/// 错误值为负的 errno，与 vfs 层保持一致。
pub trait MmInode: Send + Sync {
    /// 文件身份标识，同一文件的所有句柄必须返回相同值
    ///
    /// 共享映射按此标识复用同一个后备对象。
    fn identity(&self) -> u64;

    /// 当前文件长度（字节）
    fn size(&self) -> usize;

    /// 从指定偏移读取数据到缓冲区，返回实际读取字节数（到达文件尾时可能偏短）
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 将缓冲区数据写入指定偏移
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;
}

/// 可映射到内存的已打开文件
pub trait MmFile: Send + Sync {
    /// 获取底层 Inode 用于读写操作
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize>;

    /// 文件是否以可读方式打开
    fn readable(&self) -> bool;

    /// 文件是否以可写方式打开
    fn writable(&self) -> bool;
}
