//! 页号与页号区间
//!
//! 页号是地址除以页大小后的索引。区间一律是半开的 `[start, end)`，
//! 相邻区间不视为重叠，这一点是区域拆分与合并判断的基础。

use core::fmt;

use super::page_size;
use super::types::{AlignOps, Paddr, UsizeConvert, Vaddr};

/// 页号公共接口
pub trait PageNum: UsizeConvert + Ord + fmt::Debug {
    /// 关联的地址类型
    type Addr: AlignOps;

    /// 包含该地址的页
    fn from_addr_floor(addr: Self::Addr) -> Self {
        Self::from_usize(addr.as_usize() / page_size())
    }

    /// 不小于该地址的第一个页边界所在的页，溢出时返回 `None`
    fn from_addr_ceil(addr: Self::Addr) -> Option<Self> {
        addr.align_up_to_page()
            .map(|a| Self::from_usize(a.as_usize() / page_size()))
    }

    /// 页起始地址
    fn start_addr(self) -> Self::Addr {
        Self::Addr::from_usize(self.as_usize() * page_size())
    }

    /// 向后偏移 `pages` 页
    fn add(self, pages: usize) -> Self {
        Self::from_usize(self.as_usize() + pages)
    }

    /// 向前偏移 `pages` 页
    fn sub(self, pages: usize) -> Self {
        Self::from_usize(self.as_usize() - pages)
    }

    /// `self - other` 的页数，要求 `self >= other`
    fn pages_since(self, other: Self) -> usize {
        debug_assert!(self >= other);
        self.as_usize() - other.as_usize()
    }
}

macro_rules! impl_page_num {
    ($name:ident, $addr:ty, $tag:literal) => {
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

        impl PageNum for $name {
            type Addr = $addr;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:#x})"), self.0)
            }
        }
    };
}

/// 物理页号
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ppn(pub usize);
impl_page_num!(Ppn, Paddr, "Ppn");

/// 虚拟页号
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vpn(pub usize);
impl_page_num!(Vpn, Vaddr, "Vpn");

/// 半开页号区间 `[start, end)`
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageRange<T: PageNum> {
    start: T,
    end: T,
}

impl<T: PageNum> PageRange<T> {
    /// 创建区间，要求 `start <= end`
    pub fn new(start: T, end: T) -> Self {
        debug_assert!(start <= end, "PageRange: start {:?} > end {:?}", start, end);
        Self { start, end }
    }

    /// 由起始页号与页数创建区间
    pub fn from_start_len(start: T, len: usize) -> Self {
        Self::new(start, start.add(len))
    }

    /// 起始页号（包含）
    pub fn start(&self) -> T {
        self.start
    }

    /// 结束页号（不包含）
    pub fn end(&self) -> T {
        self.end
    }

    /// 区间页数
    pub fn len(&self) -> usize {
        self.end.pages_since(self.start)
    }

    /// 区间是否为空
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 是否包含给定页
    pub fn contains(&self, page: T) -> bool {
        page >= self.start && page < self.end
    }

    /// 是否完整包含另一个区间
    pub fn contains_range(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// 两个区间是否有公共页
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// 两个区间的交集，不相交时返回 `None`
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Self::new(start, end))
    }

    /// 区间迭代器
    pub fn iter(&self) -> PageRangeIter<T> {
        PageRangeIter {
            next: self.start,
            end: self.end,
        }
    }
}

impl<T: PageNum> fmt::Debug for PageRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}

impl<T: PageNum> IntoIterator for PageRange<T> {
    type Item = T;
    type IntoIter = PageRangeIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 按升序遍历区间内的页号
pub struct PageRangeIter<T: PageNum> {
    next: T,
    end: T,
}

impl<T: PageNum> Iterator for PageRangeIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next >= self.end {
            return None;
        }
        let page = self.next;
        self.next = page.add(1);
        Some(page)
    }
}

/// 物理页号区间
pub type PpnRange = PageRange<Ppn>;
/// 虚拟页号区间
pub type VpnRange = PageRange<Vpn>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_page_num_floor_ceil() {
        test_utils::init();
        let a = Vaddr::new(4096);
        assert_eq!(Vpn::from_addr_floor(a), Vpn(1));
        assert_eq!(Vpn::from_addr_ceil(a), Some(Vpn(1)));

        let b = Vaddr::new(4097);
        assert_eq!(Vpn::from_addr_floor(b), Vpn(1));
        assert_eq!(Vpn::from_addr_ceil(b), Some(Vpn(2)));

        assert_eq!(Vpn::from_addr_ceil(Vaddr::new(usize::MAX)), None);
        assert_eq!(Vpn(3).start_addr(), Vaddr::new(3 * 4096));
    }

    #[test]
    fn test_range_overlap_is_half_open() {
        test_utils::init();
        let a = VpnRange::new(Vpn(0), Vpn(2));
        let b = VpnRange::new(Vpn(2), Vpn(4));
        let c = VpnRange::new(Vpn(1), Vpn(3));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c) && b.overlaps(&c));
        assert_eq!(a.intersection(&c), Some(VpnRange::new(Vpn(1), Vpn(2))));
        assert_eq!(a.intersection(&b), None);
        assert!(VpnRange::new(Vpn(0), Vpn(4)).contains_range(&c));
    }

    #[test]
    fn test_range_iter() {
        test_utils::init();
        let pages: alloc::vec::Vec<_> = VpnRange::from_start_len(Vpn(5), 3).into_iter().collect();
        assert_eq!(pages, [Vpn(5), Vpn(6), Vpn(7)]);
        assert!(VpnRange::new(Vpn(5), Vpn(5)).iter().next().is_none());
    }
}
