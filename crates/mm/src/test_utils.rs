//! 单元测试公共设施
//!
//! 将 test-support 中的 Mock 注册为本 crate 的架构操作与配置，并提供一段
//! 宿主机内存作为物理内存。

extern crate std;

use alloc::sync::Arc;
use std::sync::Once;

use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::fs::MockInode;
use test_support::mock::mm::{alloc_phys_memory, MockMmConfig, MockMmOps, MOCK_MM_CONFIG, MOCK_MM_OPS};

use crate::address::{Ppn, PageNum, UsizeConvert};
use crate::frame_allocator::FrameAllocator;
use crate::{ArchMmOps, MmConfig, MmInode, arch_ops};

/// 测试用物理内存的初始填充字节
pub const POISON: u8 = 0xA5;

struct TestIntr;

impl sync::ArchOps for TestIntr {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn interrupt_enable_bit(&self) -> usize {
        MOCK_ARCH_OPS.interrupt_enable_bit()
    }

    fn cpu_id(&self) -> usize {
        MOCK_ARCH_OPS.cpu_id()
    }
}

static TEST_INTR: TestIntr = TestIntr;

impl ArchMmOps for MockMmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MockMmOps::paddr_to_vaddr(self, paddr)
    }

    fn flush_tlb_page(&self, _root: Ppn, _vpn: crate::Vpn) {
        MockMmOps::flush_tlb_page(self)
    }

    fn flush_tlb_all(&self, _root: Ppn) {
        MockMmOps::flush_tlb_all(self)
    }

    fn num_cpus(&self) -> usize {
        MockMmOps::num_cpus(self)
    }

    fn send_tlb_shootdown(&self, _root: Ppn) {
        MockMmOps::send_tlb_shootdown(self)
    }
}

impl MmConfig for MockMmConfig {
    fn page_size(&self) -> usize {
        MockMmConfig::page_size(self)
    }

    fn user_space_start(&self) -> usize {
        MockMmConfig::user_space_start(self)
    }

    fn user_space_end(&self) -> usize {
        MockMmConfig::user_space_end(self)
    }

    fn mmap_base(&self) -> usize {
        MockMmConfig::mmap_base(self)
    }
}

static INIT: Once = Once::new();

/// 注册 Mock 实现（幂等）
pub fn init() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&TEST_INTR);
        crate::register_arch_ops(&MOCK_MM_OPS);
        crate::register_config(&MOCK_MM_CONFIG);
    });
}

/// 创建管理 `pages` 个帧的分配器，内存预先填充 [`POISON`]
pub fn frames(pages: usize) -> Arc<FrameAllocator> {
    init();
    let (start, end) = alloc_phys_memory(pages, POISON);
    FrameAllocator::new(start, end)
}

/// 把 [`MockInode`] 包装为 [`MmInode`]
pub struct TestInode(Arc<MockInode>);

impl TestInode {
    pub fn wrap(inode: &Arc<MockInode>) -> Arc<dyn MmInode> {
        Arc::new(TestInode(inode.clone()))
    }
}

impl MmInode for TestInode {
    fn identity(&self) -> u64 {
        self.0.ino
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        self.0.read_at(offset, buf)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        self.0.write_at(offset, buf)
    }
}

fn frame_ptr(ppn: Ppn, offset: usize) -> *mut u8 {
    (arch_ops().paddr_to_vaddr(ppn.start_addr().as_usize()) + offset) as *mut u8
}

/// 读取物理帧 `ppn` 的开头 `buf.len()` 字节
pub fn read_frame(ppn: Ppn, buf: &mut [u8]) {
    assert!(buf.len() <= MOCK_MM_CONFIG.page_size());
    // SAFETY: 恒等映射下 ppn 指向测试分配的物理内存，长度不越过页
    unsafe { core::ptr::copy_nonoverlapping(frame_ptr(ppn, 0), buf.as_mut_ptr(), buf.len()) }
}

/// 向物理帧 `ppn` 的 `offset` 处写入 `data`
pub fn write_frame(ppn: Ppn, offset: usize, data: &[u8]) {
    assert!(offset + data.len() <= MOCK_MM_CONFIG.page_size());
    // SAFETY: 同上
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), frame_ptr(ppn, offset), data.len()) }
}
