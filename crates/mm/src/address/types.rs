//! 物理地址与虚拟地址类型

use core::fmt;

/// 与 `usize` 之间的无损转换
pub trait UsizeConvert: Copy {
    /// 取出原始数值
    fn as_usize(&self) -> usize;
    /// 由原始数值构造
    fn from_usize(value: usize) -> Self;
}

/// 页对齐操作
pub trait AlignOps: UsizeConvert {
    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        let page = super::page_size();
        Self::from_usize(self.as_usize() & !(page - 1))
    }

    /// 向上对齐到页边界，溢出时返回 `None`
    fn align_up_to_page(self) -> Option<Self> {
        let page = super::page_size();
        self.as_usize()
            .checked_add(page - 1)
            .map(|v| Self::from_usize(v & !(page - 1)))
    }

    /// 是否位于页边界
    fn is_page_aligned(self) -> bool {
        self.as_usize() & (super::page_size() - 1) == 0
    }

    /// 页内偏移
    fn page_offset(self) -> usize {
        self.as_usize() & (super::page_size() - 1)
    }
}

macro_rules! impl_address {
    ($name:ident, $tag:literal) => {
        impl UsizeConvert for $name {
            #[inline]
            fn as_usize(&self) -> usize {
                self.0
            }

            #[inline]
            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl AlignOps for $name {}

        impl $name {
            /// 构造地址
            pub const fn new(value: usize) -> Self {
                Self(value)
            }

            /// 加上字节偏移，溢出时返回 `None`
            pub fn checked_add(self, bytes: usize) -> Option<Self> {
                self.0.checked_add(bytes).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:#x})"), self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Paddr(usize);
impl_address!(Paddr, "Paddr");

/// 虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vaddr(usize);
impl_address!(Vaddr, "Vaddr");

impl Paddr {
    /// 通过直接映射区得到内核可访问的虚拟地址
    pub fn to_kernel_vaddr(self) -> Vaddr {
        Vaddr(crate::arch_ops().paddr_to_vaddr(self.0))
    }
}
