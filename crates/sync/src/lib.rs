//! 同步原语
//!
//! 向内存管理子系统提供基本的锁原语：
//! - [`SpinLock`]：关中断自旋锁，保护地址空间、后备对象与帧分配器
//! - [`RwLock`]：基于 `lock_api` 的读写自旋锁，用于读多写少的全局表
//! - [`IntrGuard`]：中断保护 RAII 守卫
//!
//! # 架构依赖
//!
//! 此 crate 通过 [`ArchOps`] trait 抽象中断控制。
//! 使用前必须调用 [`register_arch_ops`] 注册实现。

#![no_std]

mod intr_guard;
mod rwlock;
mod spin_lock;

pub use intr_guard::IntrGuard;
pub use rwlock::{RawRwSpinLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spin_lock::{RawSpinLock, RawSpinLockGuard, SpinLock, SpinLockGuard};

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作的 trait
///
/// 由内核主体实现并注册，提供中断控制和 CPU 信息
pub trait ArchOps: Send + Sync {
    /// 读取并禁用本地中断，返回之前的状态
    ///
    /// # Safety
    /// 返回值必须原样交还给 [`ArchOps::restore_interrupts`]
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 中断使能位掩码
    fn interrupt_enable_bit(&self) -> usize;

    /// 获取当前 CPU ID
    fn cpu_id(&self) -> usize;
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// 重复注册会覆盖之前的实现。
///
/// # Safety
/// 必须在任何锁被使用之前调用
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取架构操作实例
#[inline]
pub(crate) fn arch_ops() -> &'static dyn ArchOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("sync: ArchOps not registered, call register_arch_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) }
}
