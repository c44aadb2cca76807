//! 架构相关内存管理操作 trait 定义和注册

use crate::address::{Ppn, Vpn};
use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关内存管理操作
///
/// 此 trait 抽象了架构特定的内存操作，包括物理内存访问和 TLB 管理。
/// 内核需要为具体架构实现此 trait。
pub trait ArchMmOps: Send + Sync {
    /// 将物理地址转换为内核可直接访问的虚拟地址（直接映射区域）
    fn paddr_to_vaddr(&self, paddr: usize) -> usize;

    /// 在本地 CPU 上失效 `root` 地址空间中 `vpn` 对应的 TLB 条目
    fn flush_tlb_page(&self, root: Ppn, vpn: Vpn);

    /// 在本地 CPU 上失效 `root` 地址空间的全部 TLB 条目
    fn flush_tlb_all(&self, root: Ppn);

    /// 获取 CPU 数量（用于 TLB shootdown）
    fn num_cpus(&self) -> usize;

    /// 通知其他 CPU 失效 `root` 地址空间的 TLB，返回前须确保所有 CPU 已完成
    fn send_tlb_shootdown(&self, root: Ppn);
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchMmOps) {
    let ptr = ops as *const dyn ArchMmOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchMmOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchMmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("mm: ArchMmOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchMmOps>((data, vtable)) }
}
