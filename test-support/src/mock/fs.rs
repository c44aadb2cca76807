//! 文件相关操作的 Mock 实现
//!
//! [`MockInode`] 用内存中的字节数组模拟文件内容，并可以注入读写失败；
//! [`MockFile`] 模拟一个打开的文件描述（带读写权限）。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

/// EIO
const EIO: isize = 5;

/// 内存文件
pub struct MockInode {
    pub ino: u64,
    pub data: Mutex<Vec<u8>>,
    pub fail_reads: AtomicBool,
    /// 接下来需要失败的写次数
    pub failing_writes: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl MockInode {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            ino: NEXT_INODE.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(data),
            fail_reads: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// 每页第一个字节为页号（取低 8 位），其余为 `fill`
    pub fn with_pattern(pages: usize, page_size: usize, fill: u8) -> Arc<Self> {
        let mut data = vec![fill; pages * page_size];
        for page in 0..pages {
            data[page * page_size] = page as u8;
        }
        Self::new(data)
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(-EIO);
        }
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let failing = self.failing_writes.load(Ordering::Relaxed);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::Relaxed);
            return Err(-EIO);
        }
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    /// 文件长度
    pub fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// 读取文件内容的一个副本
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// 打开的文件
pub struct MockFile {
    pub inode: Arc<MockInode>,
    pub readable: bool,
    pub writable: bool,
}

impl MockFile {
    pub fn new(inode: Arc<MockInode>, readable: bool, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            inode,
            readable,
            writable,
        })
    }
}
