//! Shared harness for mm integration tests: mock registration, host-backed
//! physical memory and file adapters.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use mm::{ArchMmOps, Asid, FrameAllocator, MemoryManager, MmConfig, MmFile, MmInode, Ppn, Vpn};
use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::fs::{MockFile, MockInode};
use test_support::mock::mm::{alloc_phys_memory, MOCK_MM_CONFIG, MOCK_MM_OPS};

pub const PAGE: usize = 4096;
pub const POISON: u8 = 0xA5;

struct Intr;

impl sync::ArchOps for Intr {
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

struct Mmu;

impl ArchMmOps for Mmu {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MOCK_MM_OPS.paddr_to_vaddr(paddr)
    }

    fn flush_tlb_page(&self, _root: Ppn, _vpn: Vpn) {
        MOCK_MM_OPS.flush_tlb_page()
    }

    fn flush_tlb_all(&self, _root: Ppn) {
        MOCK_MM_OPS.flush_tlb_all()
    }

    fn num_cpus(&self) -> usize {
        MOCK_MM_OPS.num_cpus()
    }

    fn send_tlb_shootdown(&self, _root: Ppn) {
        MOCK_MM_OPS.send_tlb_shootdown()
    }
}

struct Layout;

impl MmConfig for Layout {
    fn page_size(&self) -> usize {
        MOCK_MM_CONFIG.page_size()
    }

    fn user_space_start(&self) -> usize {
        MOCK_MM_CONFIG.user_space_start()
    }

    fn user_space_end(&self) -> usize {
        MOCK_MM_CONFIG.user_space_end()
    }

    fn mmap_base(&self) -> usize {
        MOCK_MM_CONFIG.mmap_base()
    }
}

static INTR: Intr = Intr;
static MMU: Mmu = Mmu;
static LAYOUT: Layout = Layout;
static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&INTR);
        mm::register_arch_ops(&MMU);
        mm::register_config(&LAYOUT);
    });
}

pub fn mmap_base() -> usize {
    MOCK_MM_CONFIG.mmap_base()
}

/// Frame allocator over `pages` frames of poisoned host memory.
pub fn frames(pages: usize) -> Arc<FrameAllocator> {
    init();
    let (start, end) = alloc_phys_memory(pages, POISON);
    FrameAllocator::new(start, end)
}

pub fn manager(pages: usize) -> MemoryManager {
    MemoryManager::new(frames(pages))
}

pub struct Inode(pub Arc<MockInode>);

impl MmInode for Inode {
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

pub struct File(pub Arc<MockFile>);

impl File {
    pub fn open(inode: &Arc<MockInode>, readable: bool, writable: bool) -> Self {
        File(MockFile::new(inode.clone(), readable, writable))
    }
}

impl MmFile for File {
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize> {
        Ok(Arc::new(Inode(self.0.inode.clone())))
    }

    fn readable(&self) -> bool {
        self.0.readable
    }

    fn writable(&self) -> bool {
        self.0.writable
    }
}

pub fn read_u32(mm: &MemoryManager, asid: Asid, addr: usize) -> u32 {
    let mut buf = [0u8; 4];
    mm.copy_from_user(asid, addr, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

pub fn write_u32(mm: &MemoryManager, asid: Asid, addr: usize, value: u32) {
    mm.copy_to_user(asid, addr, &value.to_le_bytes()).unwrap();
}
