//! 内存管理相关操作的 Mock 实现
//!
//! 直接映射采用恒等映射（vaddr == paddr），因此宿主机上的一段页对齐缓冲区
//! 可以直接交给帧分配器当作物理内存使用，见 [`alloc_phys_memory`]。

use std::alloc::{alloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 测试使用的页大小
pub const PAGE_SIZE: usize = 4096;

/// Mock 的内存管理架构操作
///
/// 记录 TLB 刷新次数，便于测试观察刷新是否发生。
pub struct MockMmOps {
    pub page_flushes: AtomicUsize,
    pub full_flushes: AtomicUsize,
    pub shootdowns: AtomicUsize,
}

impl MockMmOps {
    pub const fn new() -> Self {
        Self {
            page_flushes: AtomicUsize::new(0),
            full_flushes: AtomicUsize::new(0),
            shootdowns: AtomicUsize::new(0),
        }
    }

    /// 物理地址转内核虚拟地址（恒等映射）
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        paddr
    }

    /// 刷新单页 TLB（只计数）
    pub fn flush_tlb_page(&self) {
        self.page_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// 刷新整个地址空间的 TLB（只计数）
    pub fn flush_tlb_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// 向其他 CPU 发送 TLB shootdown（只计数）
    pub fn send_tlb_shootdown(&self) {
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// CPU 数量（测试默认：1）
    pub fn num_cpus(&self) -> usize {
        1
    }

    /// 所有 TLB 刷新的总次数
    pub fn total_flushes(&self) -> usize {
        self.page_flushes.load(Ordering::Relaxed) + self.full_flushes.load(Ordering::Relaxed)
    }
}

impl Default for MockMmOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_OPS: MockMmOps = MockMmOps::new();

/// Mock 的内存布局配置
pub struct MockMmConfig;

impl MockMmConfig {
    pub const fn new() -> Self {
        Self
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// 用户空间下界（保留第 0 页以捕获空指针）
    pub fn user_space_start(&self) -> usize {
        0x1000
    }

    /// 用户空间上界（Sv39 低半区）
    pub fn user_space_end(&self) -> usize {
        0x40_0000_0000
    }

    /// 非固定 mmap 的搜索起点
    pub fn mmap_base(&self) -> usize {
        0x10_0000_0000
    }
}

impl Default for MockMmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_CONFIG: MockMmConfig = MockMmConfig::new();

/// 分配一段页对齐的缓冲区充当物理内存，并用 `fill` 填满
///
/// 返回 `[start, end)` 地址区间。缓冲区被有意泄漏，生命周期与测试进程相同。
pub fn alloc_phys_memory(pages: usize, fill: u8) -> (usize, usize) {
    assert!(pages > 0);
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    // SAFETY: layout 大小非零
    let ptr = unsafe { alloc(layout) };
    assert!(!ptr.is_null(), "mock physical memory allocation failed");
    // SAFETY: ptr 指向刚分配的 layout.size() 字节
    unsafe { core::ptr::write_bytes(ptr, fill, layout.size()) };
    let start = ptr as usize;
    (start, start + layout.size())
}
