//! 页表项与架构无关的标志位

use crate::address::Ppn;
use bitflags::bitflags;

bitflags! {
    /// 通用页表项标志
    ///
    /// 位布局与 RISC-V Sv39 叶子项一致，其他架构实现时自行转换。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UniversalPTEFlag: usize {
        /// 有效位
        const VALID = 1 << 0;
        /// 可读
        const READABLE = 1 << 1;
        /// 可写
        const WRITEABLE = 1 << 2;
        /// 可执行
        const EXECUTABLE = 1 << 3;
        /// 用户态可访问
        const USER_ACCESSIBLE = 1 << 4;
        /// 全局映射
        const GLOBAL = 1 << 5;
        /// 已访问
        const ACCESSED = 1 << 6;
        /// 已写脏
        const DIRTY = 1 << 7;
    }
}

impl UniversalPTEFlag {
    /// 用户叶子页的基础标志
    pub const fn user_leaf() -> Self {
        Self::VALID
            .union(Self::USER_ACCESSIBLE)
            .union(Self::ACCESSED)
            .union(Self::DIRTY)
    }

    /// 是否带有任一访问权限位（叶子项）
    pub fn is_leaf(self) -> bool {
        self.intersects(Self::READABLE | Self::WRITEABLE | Self::EXECUTABLE)
    }
}

/// 页表项接口
pub trait PageTableEntry: Copy {
    /// 由物理页号和标志构造页表项
    fn new(ppn: Ppn, flags: UniversalPTEFlag) -> Self;
    /// 空页表项
    fn empty() -> Self;
    /// 指向的物理页号
    fn ppn(&self) -> Ppn;
    /// 标志位
    fn flags(&self) -> UniversalPTEFlag;
    /// 有效位是否置位
    fn is_valid(&self) -> bool {
        self.flags().contains(UniversalPTEFlag::VALID)
    }
    /// 是否为叶子项
    fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }
}

/// Sv39 页表项：`ppn << 10 | flags`
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sv39Pte(pub u64);

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = (1 << 44) - 1;
const FLAG_MASK: u64 = 0xff;

impl PageTableEntry for Sv39Pte {
    fn new(ppn: Ppn, flags: UniversalPTEFlag) -> Self {
        Self(((ppn.0 as u64 & PPN_MASK) << PPN_SHIFT) | (flags.bits() as u64 & FLAG_MASK))
    }

    fn empty() -> Self {
        Self(0)
    }

    fn ppn(&self) -> Ppn {
        Ppn(((self.0 >> PPN_SHIFT) & PPN_MASK) as usize)
    }

    fn flags(&self) -> UniversalPTEFlag {
        UniversalPTEFlag::from_bits_truncate((self.0 & FLAG_MASK) as usize)
    }
}

impl core::fmt::Debug for Sv39Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sv39Pte")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}
