//! 中断控制相关操作的 Mock 实现

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 中断使能位
const SIE: usize = 0x2;

/// Mock 架构操作
pub struct MockArchOps {
    pub interrupt_state: AtomicBool,
    pub cpu_id: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
            cpu_id: AtomicUsize::new(0),
        }
    }

    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        if self.interrupt_state.swap(false, Ordering::SeqCst) {
            SIE
        } else {
            0
        }
    }

    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state.store(flags & SIE != 0, Ordering::SeqCst);
    }

    pub fn interrupt_enable_bit(&self) -> usize {
        SIE
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id.load(Ordering::Relaxed)
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
