//! 读写自旋锁
//!
//! 通过 `lock_api` 暴露标准的 `RwLock` 接口。读者之间可以并行，写者独占。
//! 与 [`crate::SpinLock`] 不同，它不会关闭中断，不能在中断上下文中使用。

use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use lock_api::{GuardSend, RawRwLock};

/// 写者占用标志位
const WRITER: usize = 1;
/// 每个读者占用的计数单位
const READER: usize = 2;

/// 读写自旋锁的原始实现
pub struct RawRwSpinLock {
    state: AtomicUsize,
}

unsafe impl RawRwLock for RawRwSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawRwSpinLock {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        while !self.try_lock_shared() {
            hint::spin_loop();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let prev = self.state.fetch_add(READER, Ordering::Acquire);
        if prev & WRITER != 0 {
            self.state.fetch_sub(READER, Ordering::Release);
            return false;
        }
        true
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(READER, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        while !self.try_lock_exclusive() {
            hint::spin_loop();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

/// 读写锁
pub type RwLock<T> = lock_api::RwLock<RawRwSpinLock, T>;
/// 读守卫
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinLock, T>;
/// 写守卫
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinLock, T>;
