//! 自旋锁
//!
//! [`RawSpinLock`] 只负责原子标志与关中断；[`SpinLock`] 在其上包装受保护的数据。
//! 两者都不可重入：持锁期间再次获取同一把锁会死锁。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::intr_guard::IntrGuard;

/// 不携带数据的自旋锁
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// 创建一个未上锁的实例
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
        }
    }

    /// 关中断后自旋直到拿到锁
    pub fn lock(&self) -> RawSpinLockGuard<'_> {
        let intr_guard = IntrGuard::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // 先只读等待，避免在竞争时反复抢占缓存行
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        RawSpinLockGuard {
            lock: self,
            _intr_guard: intr_guard,
        }
    }

    /// 尝试获取锁；失败时立即恢复中断状态并返回 `None`
    pub fn try_lock(&self) -> Option<RawSpinLockGuard<'_>> {
        let intr_guard = IntrGuard::new();
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RawSpinLockGuard {
                lock: self,
                _intr_guard: intr_guard,
            })
    }

    /// 锁当前是否被占用（仅用于断言与调试）
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// [`RawSpinLock`] 的 RAII 守卫
///
/// Drop 时先释放锁标志，再由内部的 [`IntrGuard`] 恢复中断状态。
pub struct RawSpinLockGuard<'a> {
    lock: &'a RawSpinLock,
    _intr_guard: IntrGuard,
}

impl Drop for RawSpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// 提供对数据互斥访问的自旋锁
///
/// ```ignore
/// let lock = SpinLock::new(0);
/// {
///     let mut guard = lock.lock();
///     *guard += 1;
/// }
/// ```
///
/// 持锁期间本地中断处于关闭状态，临界区内应避免长时间运行的操作。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: 对 data 的访问都经过 raw 的互斥
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的 SpinLock
    pub const fn new(data: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// 消耗锁，取出内部数据
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取锁并返回访问守卫
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let raw_guard = self.raw.lock();
        SpinLockGuard {
            _raw_guard: raw_guard,
            // SAFETY: 已持有锁，此期间不存在其他引用
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 尝试获取锁
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().map(|raw_guard| SpinLockGuard {
            _raw_guard: raw_guard,
            // SAFETY: 同上
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 通过独占引用直接访问数据，无需加锁
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// 锁当前是否被占用（仅用于断言与调试）
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// [`SpinLock`] 的 RAII 守卫，离开作用域时释放锁
pub struct SpinLockGuard<'a, T: ?Sized> {
    _raw_guard: RawSpinLockGuard<'a>,
    data: &'a mut T,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}
