//! 区域（Region）
//!
//! 区域是地址空间中一段页对齐、非空、连续的虚拟地址范围，带统一的权限、
//! 共享方式和用途标签，并通过对象内偏移映射到一个后备对象的窗口。

use alloc::string::String;
use core::fmt;

use bitflags::bitflags;

use super::backing_object::ObjectRef;
use crate::address::{PageNum, UsizeConvert, Vaddr, Vpn, VpnRange};
use crate::page_table::UniversalPTEFlag;
use uapi::mm::ProtFlags;

bitflags! {
    /// 区域访问权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemPerm: u8 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXEC = 1 << 2;
    }
}

impl From<ProtFlags> for MemPerm {
    fn from(prot: ProtFlags) -> Self {
        let mut perm = MemPerm::empty();
        perm.set(MemPerm::READ, prot.contains(ProtFlags::READ));
        perm.set(MemPerm::WRITE, prot.contains(ProtFlags::WRITE));
        perm.set(MemPerm::EXEC, prot.contains(ProtFlags::EXEC));
        perm
    }
}

/// 共享方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// 私有，fork 与写入时写时复制
    Private,
    /// 共享，写入对所有映射者可见
    Shared,
}

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// 读
    Read,
    /// 写
    Write,
    /// 取指
    Execute,
}

/// 地址空间中的一段映射
pub struct Region {
    range: VpnRange,
    perm: MemPerm,
    /// 允许通过 mprotect 获得写权限（只读打开的共享文件映射为假）
    may_write: bool,
    share: ShareMode,
    object: ObjectRef,
    /// `range.start` 对应的对象内页号
    object_offset: usize,
    name: String,
}

impl Region {
    /// 创建区域
    ///
    /// # Panics
    /// `range` 为空时 panic
    pub fn new(
        range: VpnRange,
        perm: MemPerm,
        share: ShareMode,
        object: ObjectRef,
        object_offset: usize,
        name: String,
    ) -> Self {
        assert!(!range.is_empty(), "empty region");
        Self {
            range,
            perm,
            may_write: true,
            share,
            object,
            object_offset,
            name,
        }
    }

    /// 限制后续可获得的权限
    pub fn with_may_write(mut self, may_write: bool) -> Self {
        self.may_write = may_write;
        self
    }

    /// 页号范围
    pub fn range(&self) -> VpnRange {
        self.range
    }

    /// 起始页号
    pub fn start(&self) -> Vpn {
        self.range.start()
    }

    /// 结束页号（不包含）
    pub fn end(&self) -> Vpn {
        self.range.end()
    }

    /// 页数
    pub fn pages(&self) -> usize {
        self.range.len()
    }

    /// 当前权限
    pub fn perm(&self) -> MemPerm {
        self.perm
    }

    pub(super) fn set_perm(&mut self, perm: MemPerm) {
        self.perm = perm;
    }

    /// 是否允许获得写权限
    pub fn may_write(&self) -> bool {
        self.may_write
    }

    /// 共享方式
    pub fn share(&self) -> ShareMode {
        self.share
    }

    /// 后备对象
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// 起始页对应的对象内页号
    pub fn object_offset(&self) -> usize {
        self.object_offset
    }

    /// 用途标签
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 地址是否落在区域内
    pub fn contains(&self, addr: Vaddr) -> bool {
        self.range.contains(Vpn::from_addr_floor(addr))
    }

    /// 区域权限是否允许该访问
    pub fn permissions_allow(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.perm.contains(MemPerm::READ),
            AccessKind::Write => self.perm.contains(MemPerm::WRITE),
            AccessKind::Execute => self.perm.contains(MemPerm::EXEC),
        }
    }

    /// 地址对应的对象内页号
    pub fn translate_to_object_offset(&self, addr: Vaddr) -> usize {
        self.page_index(Vpn::from_addr_floor(addr))
    }

    /// 页号对应的对象内页号
    pub fn page_index(&self, vpn: Vpn) -> usize {
        debug_assert!(self.range.contains(vpn));
        self.object_offset + vpn.pages_since(self.range.start())
    }

    /// 丢弃 `new_start` 之前的部分
    ///
    /// # Panics
    /// `new_start` 不在 `(start, end)` 之内时 panic
    pub fn shrink_from_start(&mut self, new_start: Vpn) {
        assert!(
            new_start > self.start() && new_start < self.end(),
            "shrink_from_start: {:?} outside {:?}",
            new_start,
            self.range
        );
        self.object_offset += new_start.pages_since(self.start());
        self.range = VpnRange::new(new_start, self.end());
    }

    /// 丢弃 `new_end` 及之后的部分
    ///
    /// # Panics
    /// `new_end` 不在 `(start, end)` 之内时 panic
    pub fn shrink_from_end(&mut self, new_end: Vpn) {
        assert!(
            new_end > self.start() && new_end < self.end(),
            "shrink_from_end: {:?} outside {:?}",
            new_end,
            self.range
        );
        self.range = VpnRange::new(self.start(), new_end);
    }

    /// 在 `at` 处拆分为 `[start, at)` 与 `[at, end)`
    ///
    /// 两半共享同一后备对象，右半的对象内偏移相应前移。
    ///
    /// # Panics
    /// `at` 不在 `(start, end)` 之内时 panic
    pub fn split_at(self, at: Vpn) -> (Region, Region) {
        assert!(
            at > self.start() && at < self.end(),
            "split_at: {:?} outside {:?}",
            at,
            self.range
        );
        let right = Region {
            range: VpnRange::new(at, self.end()),
            perm: self.perm,
            may_write: self.may_write,
            share: self.share,
            object: self.object.clone(),
            object_offset: self.object_offset + at.pages_since(self.start()),
            name: self.name.clone(),
        };
        let mut left = self;
        left.range = VpnRange::new(left.start(), at);
        (left, right)
    }

    /// 以相同的范围与属性、不同的后备对象复制区域（用于 fork）
    pub(super) fn clone_with_object(&self, object: ObjectRef) -> Region {
        Region {
            range: self.range,
            perm: self.perm,
            may_write: self.may_write,
            share: self.share,
            object,
            object_offset: self.object_offset,
            name: self.name.clone(),
        }
    }

    /// `next` 是否紧随其后且可以合并为一个区域
    pub fn can_merge_with(&self, next: &Region) -> bool {
        self.end() == next.start()
            && self.object.ptr_eq(&next.object)
            && self.object_offset + self.pages() == next.object_offset
            && self.perm == next.perm
            && self.may_write == next.may_write
            && self.share == next.share
            && self.name == next.name
    }

    /// 将紧随其后的 `next` 合并进来
    pub fn merge(&mut self, next: Region) {
        debug_assert!(self.can_merge_with(&next));
        self.range = VpnRange::new(self.start(), next.end());
    }

    /// 该区域页面的页表项标志；`writable` 为假时即使区域可写也只读安装
    pub fn pte_flags(&self, writable: bool) -> UniversalPTEFlag {
        let mut flags = UniversalPTEFlag::user_leaf();
        if self.perm.intersects(MemPerm::READ | MemPerm::WRITE) {
            flags |= UniversalPTEFlag::READABLE;
        }
        if writable && self.perm.contains(MemPerm::WRITE) {
            flags |= UniversalPTEFlag::WRITEABLE;
        }
        if self.perm.contains(MemPerm::EXEC) {
            flags |= UniversalPTEFlag::EXECUTABLE;
        }
        flags
    }

    /// 生成只读快照
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            start: self.start().start_addr(),
            end: self.end().start_addr(),
            perm: self.perm,
            share: self.share,
            offset: self.object_offset * crate::mm_config().page_size(),
            identity: self.object.identity(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("range", &self.range)
            .field("perm", &self.perm)
            .field("share", &self.share)
            .field("object_offset", &self.object_offset)
            .field("name", &self.name)
            .finish()
    }
}

/// 区域的只读快照，不持有区域或对象的引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// 起始地址
    pub start: Vaddr,
    /// 结束地址（不包含）
    pub end: Vaddr,
    /// 权限
    pub perm: MemPerm,
    /// 共享方式
    pub share: ShareMode,
    /// 起始地址在后备对象中的字节偏移
    pub offset: usize,
    /// 文件身份标识，匿名映射为 `None`
    pub identity: Option<u64>,
    /// 用途标签
    pub name: String,
}

impl RegionInfo {
    /// 长度（字节）
    pub fn len(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// 快照总是非空
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// `/proc/<pid>/maps` 风格的一行
impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{:016x}-{:016x} {}{}{}{} {:08x} {:>8} {}",
            self.start.as_usize(),
            self.end.as_usize(),
            flag(self.perm.contains(MemPerm::READ), 'r'),
            flag(self.perm.contains(MemPerm::WRITE), 'w'),
            flag(self.perm.contains(MemPerm::EXEC), 'x'),
            if self.share == ShareMode::Shared { 's' } else { 'p' },
            self.offset,
            self.identity.unwrap_or(0),
            self.name
        )
    }
}
