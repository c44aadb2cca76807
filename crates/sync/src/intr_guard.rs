//! 中断保护器
//!
//! 创建时关闭本地中断，销毁时恢复原状态。
//! 关中断只能排除**本地 CPU** 上任务与中断处理程序之间的并发，
//! 多核之间的互斥仍由自旋锁负责。

use crate::arch_ops;

/// 中断保护器
///
/// ```ignore
/// {
///     let _guard = IntrGuard::new(); // 关中断
///     // 临界区
/// } // 恢复进入前的中断状态
/// ```
pub struct IntrGuard {
    saved: usize,
}

impl IntrGuard {
    /// 关闭本地中断并记录之前的状态
    pub fn new() -> Self {
        // SAFETY: saved 只会在 Drop 中原样交还给 restore_interrupts
        let saved = unsafe { arch_ops().read_and_disable_interrupts() };
        IntrGuard { saved }
    }

    /// 进入临界区前中断是否处于开启状态
    pub fn was_enabled(&self) -> bool {
        self.saved & arch_ops().interrupt_enable_bit() != 0
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        // SAFETY: saved 来自 new 中的 read_and_disable_interrupts
        unsafe { arch_ops().restore_interrupts(self.saved) };
    }
}
