//! 地址空间核心实现
//!
//! [`AddressSpace`] 持有一个进程的页表和有序区域集合。所有修改都要求调用者
//! 持有该地址空间的锁（由 [`crate::MemoryManager`] 负责）；页表项被清除或降权时，
//! 通过 [`TlbBatch`] 先失效 TLB，再释放退役的帧和区域。
//!
//! 文件页的读入和退役共享文件对象的写回都发生在这些方法内部，即仍在
//! 调用者持有的锁之下，见 [`crate::MemoryManager`] 的限制说明。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::backing_object::ObjectRef;
use super::region::{AccessKind, MemPerm, Region, RegionInfo, ShareMode};
use super::region_set::{RegionId, RegionSet};
use super::tlb::TlbBatch;
use crate::address::{AlignOps, PageNum, Ppn, UsizeConvert, Vaddr, Vpn, VpnRange};
use crate::error::{MmError, MmResult};
use crate::frame_allocator::FrameAllocator;
use crate::mm_config;
use crate::page_table::{PageTableInner, Sv39PageTable, UniversalPTEFlag};

/// 一次映射请求
///
/// 后备对象由调用者准备好（匿名对象、私有文件对象或共享文件对象），
/// 地址空间只负责放置与安装。
pub struct MapRequest {
    /// 期望地址；`fixed` 为假时仅作提示
    pub addr: Option<Vaddr>,
    /// 是否必须精确放在 `addr`，并替换已有映射；`addr` 为空时不起作用
    pub fixed: bool,
    /// 长度（字节），向上取整到页
    pub len: usize,
    /// 访问权限
    pub perm: MemPerm,
    /// 之后是否允许通过 mprotect 获得写权限
    pub may_write: bool,
    /// 共享方式
    pub share: ShareMode,
    /// 后备对象
    pub object: ObjectRef,
    /// 区域起始页对应的对象内页号
    pub object_offset: usize,
    /// 用途标签
    pub name: String,
    /// 是否立即填充所有页
    pub populate: bool,
}

/// 进程地址空间
pub struct AddressSpace<PT: PageTableInner = Sv39PageTable> {
    pub(super) page_table: PT,
    pub(super) regions: RegionSet,
    frames: Arc<FrameAllocator>,
    user_range: VpnRange,
    mmap_base: Vpn,
}

impl<PT: PageTableInner> AddressSpace<PT> {
    /// 创建一个空地址空间，页表帧从 `frames` 分配
    pub fn new(frames: &Arc<FrameAllocator>) -> MmResult<Self> {
        let cfg = mm_config();
        let start = Vpn::from_addr_floor(Vaddr::new(cfg.user_space_start()));
        let end = Vpn::from_addr_floor(Vaddr::new(cfg.user_space_end()));
        let mmap_base = Vpn::from_addr_floor(Vaddr::new(cfg.mmap_base())).clamp(start, end);
        Ok(Self {
            page_table: PT::new(frames)?,
            regions: RegionSet::new(),
            frames: frames.clone(),
            user_range: VpnRange::new(start, end),
            mmap_base,
        })
    }

    /// 返回页表的引用
    pub fn page_table(&self) -> &PT {
        &self.page_table
    }

    /// 返回根页表的物理页号 (PPN)
    pub fn root_ppn(&self) -> Ppn {
        self.page_table.root_ppn()
    }

    /// 物理帧分配器
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// 可用的用户地址范围
    pub fn user_range(&self) -> VpnRange {
        self.user_range
    }

    /// 区域个数
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// 按地址升序遍历区域
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.iter()
    }

    /// 包含 `addr` 的区域
    pub fn find_region(&self, addr: Vaddr) -> Option<&Region> {
        self.regions
            .find(Vpn::from_addr_floor(addr))
            .and_then(|id| self.regions.get(id))
    }

    /// 所有区域的只读快照
    pub fn snapshot(&self) -> Vec<RegionInfo> {
        self.regions.iter().map(Region::info).collect()
    }

    /// 用户地址范围中未被任何区域占用的区间，按地址升序
    pub fn free_ranges(&self) -> Vec<VpnRange> {
        let mut gaps = Vec::new();
        let mut cursor = self.user_range.start();
        for region in self.regions.iter() {
            if region.start() > cursor {
                gaps.push(VpnRange::new(cursor, region.start()));
            }
            cursor = cursor.max(region.end());
        }
        if cursor < self.user_range.end() {
            gaps.push(VpnRange::new(cursor, self.user_range.end()));
        }
        gaps
    }

    /// 寻找能容纳 `pages` 页的空闲区间
    ///
    /// 提示地址可用时优先使用，否则取 mmap 基址以上最低的空闲区间，
    /// 再退回到整个用户范围中最低的空闲区间。
    pub fn find_free_range(&self, pages: usize, hint: Option<Vpn>) -> Option<VpnRange> {
        if pages == 0 || pages > self.user_range.len() {
            return None;
        }
        if let Some(hint) = hint {
            if hint >= self.user_range.start()
                && self.user_range.end().pages_since(hint.min(self.user_range.end())) >= pages
            {
                let candidate = VpnRange::from_start_len(hint, pages);
                if self.regions.overlapping(candidate).next().is_none() {
                    return Some(candidate);
                }
            }
        }
        self.lowest_gap(self.mmap_base, pages)
            .or_else(|| self.lowest_gap(self.user_range.start(), pages))
    }

    fn lowest_gap(&self, from: Vpn, pages: usize) -> Option<VpnRange> {
        self.free_ranges().into_iter().find_map(|gap| {
            let start = gap.start().max(from);
            (start < gap.end() && gap.end().pages_since(start) >= pages)
                .then(|| VpnRange::from_start_len(start, pages))
        })
    }

    /// `[addr, addr + len)` 覆盖的页区间，`addr` 必须页对齐
    fn page_range(&self, addr: Vaddr, len: usize) -> MmResult<VpnRange> {
        if !addr.is_page_aligned() {
            return Err(MmError::InvalidArgument);
        }
        let pages = len.div_ceil(mm_config().page_size());
        let start = Vpn::from_addr_floor(addr);
        let end = start
            .as_usize()
            .checked_add(pages)
            .ok_or(MmError::InvalidArgument)?;
        Ok(VpnRange::new(start, Vpn(end)))
    }

    /// 按请求建立映射，返回起始地址
    pub fn mmap(&mut self, req: MapRequest) -> MmResult<Vaddr> {
        if req.len == 0 {
            return Err(MmError::InvalidArgument);
        }
        let pages = req.len.div_ceil(mm_config().page_size());
        if pages > self.user_range.len() {
            return Err(MmError::OutOfMemory);
        }

        // fixed 但未给地址时与普通映射一样查找空闲区间
        let range = if let (true, Some(addr)) = (req.fixed, req.addr) {
            let range = self.page_range(addr, req.len)?;
            if !self.user_range.contains_range(&range) {
                return Err(MmError::InvalidArgument);
            }
            let mut batch = TlbBatch::new(self.root_ppn());
            self.unmap_range(range, &mut batch);
            range
        } else {
            let hint = req
                .addr
                .map(|a| Vpn::from_addr_floor(a.align_down_to_page()));
            self.find_free_range(pages, hint)
                .ok_or(MmError::OutOfMemory)?
        };

        let region = Region::new(
            range,
            req.perm,
            req.share,
            req.object,
            req.object_offset,
            req.name,
        )
        .with_may_write(req.may_write);
        log::debug!("mmap: {:?}", region);
        self.insert_region(region);

        if req.populate {
            if let Some(access) = populate_access(req.perm) {
                for vpn in range {
                    if let Err(err) = self.handle_page_fault(vpn.start_addr(), access) {
                        log::debug!("mmap: populate failed at {:?}: {}, rolling back", vpn, err);
                        let mut batch = TlbBatch::new(self.root_ppn());
                        self.unmap_range(range, &mut batch);
                        return Err(err);
                    }
                }
            }
        }
        Ok(range.start().start_addr())
    }

    /// 解除 `[addr, addr + len)` 内的所有映射
    ///
    /// 范围内未映射的空洞被忽略；部分覆盖的区域被收缩或拆分。
    pub fn munmap(&mut self, addr: Vaddr, len: usize) -> MmResult<()> {
        if len == 0 {
            return Err(MmError::InvalidArgument);
        }
        let range = self.page_range(addr, len)?;
        let Some(range) = range.intersection(&self.user_range) else {
            return Ok(());
        };
        let mut batch = TlbBatch::new(self.root_ppn());
        self.unmap_range(range, &mut batch);
        Ok(())
    }

    pub(crate) fn unmap_range(&mut self, range: VpnRange, batch: &mut TlbBatch) {
        let ids: Vec<RegionId> = self.regions.overlapping(range).collect();
        for id in ids {
            let mut region = self.regions.remove(id);
            let Some(cut) = region.range().intersection(&range) else {
                self.insert_region(region);
                continue;
            };
            self.clear_pages(&region, cut, batch);

            let covers_start = range.start() <= region.start();
            let covers_end = range.end() >= region.end();
            match (covers_start, covers_end) {
                (true, true) => {
                    log::debug!("munmap: removed {:?}", region.range());
                    batch.retire_region(region);
                }
                (true, false) => {
                    region.shrink_from_start(range.end());
                    log::debug!("munmap: trimmed head, now {:?}", region.range());
                    self.insert_region(region);
                }
                (false, true) => {
                    region.shrink_from_end(range.start());
                    log::debug!("munmap: trimmed tail, now {:?}", region.range());
                    self.insert_region(region);
                }
                (false, false) => {
                    let (left, mut right) = region.split_at(range.start());
                    right.shrink_from_start(range.end());
                    log::debug!(
                        "munmap: punched hole, {:?} + {:?}",
                        left.range(),
                        right.range()
                    );
                    self.insert_region(left);
                    self.insert_region(right);
                }
            }
        }
    }

    /// 清除区域内 `pages` 的页表项；私有对象的对应槽不再可达，一并退役
    fn clear_pages(&mut self, region: &Region, pages: VpnRange, batch: &mut TlbBatch) {
        for vpn in pages {
            if self.page_table.unmap(vpn).is_ok() {
                batch.add_page(vpn);
            }
        }
        if region.share() == ShareMode::Private {
            let first = region.page_index(pages.start());
            batch.retire_frames(region.object().decommit(first..first + pages.len()));
        }
    }

    fn insert_region(&mut self, region: Region) -> RegionId {
        match self.regions.insert(region) {
            Ok(id) => id,
            Err(region) => {
                log::error!("region overlap on insert: {:?}", region);
                panic!("overlapping region {:?}", region.range());
            }
        }
    }

    /// 修改 `[addr, addr + len)` 的访问权限
    ///
    /// 范围必须被区域完整覆盖。部分覆盖的区域会被拆分，已存在的页表项按新权限
    /// 重新安装（写时复制页保持只读），最后合并相邻的兼容区域。
    pub fn mprotect(&mut self, addr: Vaddr, len: usize, perm: MemPerm) -> MmResult<()> {
        if len == 0 {
            return if addr.is_page_aligned() {
                Ok(())
            } else {
                Err(MmError::InvalidArgument)
            };
        }
        let range = self.page_range(addr, len)?;
        let ids = self.covering(range)?;
        if perm.contains(MemPerm::WRITE)
            && ids
                .iter()
                .filter_map(|&id| self.regions.get(id))
                .any(|r| !r.may_write())
        {
            return Err(MmError::PermissionDenied);
        }

        let mut batch = TlbBatch::new(self.root_ppn());
        for id in ids {
            let mut region = self.regions.remove(id);
            if region.start() < range.start() {
                let (left, right) = region.split_at(range.start());
                self.insert_region(left);
                region = right;
            }
            if region.end() > range.end() {
                let (mid, right) = region.split_at(range.end());
                self.insert_region(right);
                region = mid;
            }
            region.set_perm(perm);
            self.reapply_pte_flags(&region, &mut batch);
            self.insert_region(region);
        }
        batch.flush();

        self.coalesce(range);
        Ok(())
    }

    /// 被 `range` 相交的区域；范围中任何一页未被覆盖时返回 `InvalidRange`
    fn covering(&self, range: VpnRange) -> MmResult<Vec<RegionId>> {
        let ids: Vec<RegionId> = self.regions.overlapping(range).collect();
        let mut cursor = range.start();
        for &id in &ids {
            let Some(region) = self.regions.get(id) else {
                continue;
            };
            if region.start() > cursor {
                return Err(MmError::InvalidRange);
            }
            cursor = region.end();
        }
        if cursor < range.end() {
            return Err(MmError::InvalidRange);
        }
        Ok(ids)
    }

    fn reapply_pte_flags(&mut self, region: &Region, batch: &mut TlbBatch) {
        for vpn in region.range() {
            let Ok((_, old)) = self.page_table.walk(vpn) else {
                continue;
            };
            if region.perm().is_empty() {
                // 无权限的页不保留页表项，帧仍留在对象槽中
                if self.page_table.unmap(vpn).is_ok() {
                    batch.add_page(vpn);
                }
                continue;
            }
            let flags = region.pte_flags(writable_now(region, vpn));
            if flags != old && self.page_table.update_flags(vpn, flags).is_ok() {
                batch.add_page(vpn);
            }
        }
    }

    /// 合并 `range` 内及其两侧相邻的兼容区域
    fn coalesce(&mut self, range: VpnRange) {
        let lo = Vpn(range.start().as_usize().saturating_sub(1));
        let hi = range.end().add(1).min(self.user_range.end()).max(range.end());
        let ids: Vec<RegionId> = self.regions.overlapping(VpnRange::new(lo, hi)).collect();
        let mut iter = ids.into_iter();
        let Some(first) = iter.next() else {
            return;
        };
        let mut current = self.regions.remove(first);
        for id in iter {
            let next = self.regions.remove(id);
            if current.can_merge_with(&next) {
                log::trace!("coalesce: {:?} + {:?}", current.range(), next.range());
                current.merge(next);
            } else {
                self.insert_region(current);
                current = next;
            }
        }
        self.insert_region(current);
    }

    /// 复制整个地址空间
    ///
    /// 共享区域与父进程共享后备对象；私有区域得到写时复制的子对象（同一父对象
    /// 只生成一个子对象，拆分后的区域仍共享它）。父进程私有可写页被降为只读。
    pub fn fork(&mut self) -> MmResult<Self> {
        let mut child = Self::new(&self.frames)?;
        let mut forked: BTreeMap<usize, ObjectRef> = BTreeMap::new();
        let mut batch = TlbBatch::new(self.page_table.root_ppn());

        for region in self.regions.iter() {
            let object = match region.share() {
                ShareMode::Shared => region.object().clone(),
                ShareMode::Private => forked
                    .entry(region.object().as_ptr() as usize)
                    .or_insert_with(|| region.object().fork_for_cow())
                    .clone(),
            };
            child.insert_region(region.clone_with_object(object));

            if region.share() == ShareMode::Private {
                for vpn in region.range() {
                    let Ok((_, flags)) = self.page_table.walk(vpn) else {
                        continue;
                    };
                    if flags.contains(UniversalPTEFlag::WRITEABLE)
                        && self
                            .page_table
                            .update_flags(vpn, flags - UniversalPTEFlag::WRITEABLE)
                            .is_ok()
                    {
                        batch.add_page(vpn);
                    }
                }
            }
        }
        batch.flush();
        log::debug!(
            "fork: {} regions, {} private objects",
            child.region_count(),
            forked.len()
        );
        Ok(child)
    }

    /// 将 `[addr, addr + len)` 内共享文件映射的脏页写回文件
    pub fn msync(&mut self, addr: Vaddr, len: usize) -> MmResult<()> {
        let range = self.page_range(addr, len)?;
        if range.is_empty() {
            return Ok(());
        }
        let ids = self.covering(range)?;
        let mut objects: Vec<ObjectRef> = Vec::new();
        for id in ids {
            let Some(region) = self.regions.get(id) else {
                continue;
            };
            let object = region.object();
            if object.tracks_dirty() && !objects.iter().any(|o| o.ptr_eq(object)) {
                objects.push(object.clone());
            }
        }
        objects.iter().try_for_each(|object| object.sync())
    }

    /// 将 `data` 写入用户地址 `addr`，必要时按写访问处理缺页
    pub fn copy_to_user(&mut self, addr: Vaddr, data: &[u8]) -> MmResult<()> {
        let page_size = mm_config().page_size();
        let mut written = 0usize;
        while written < data.len() {
            let cur = addr
                .checked_add(written)
                .ok_or(MmError::SegmentationFault)?;
            let take = (data.len() - written).min(page_size - cur.page_offset());
            let kva = self.user_page(cur, AccessKind::Write)?;
            // SAFETY: user_page 保证该页已映射且可写，拷贝不越过页边界
            unsafe {
                core::ptr::copy_nonoverlapping(data[written..].as_ptr(), kva as *mut u8, take);
            }
            written += take;
        }
        Ok(())
    }

    /// 从用户地址 `addr` 读取 `out.len()` 字节，必要时按读访问处理缺页
    pub fn copy_from_user(&mut self, addr: Vaddr, out: &mut [u8]) -> MmResult<()> {
        let page_size = mm_config().page_size();
        let mut read = 0usize;
        while read < out.len() {
            let cur = addr.checked_add(read).ok_or(MmError::SegmentationFault)?;
            let take = (out.len() - read).min(page_size - cur.page_offset());
            let kva = self.user_page(cur, AccessKind::Read)?;
            // SAFETY: user_page 保证该页已映射且可读，拷贝不越过页边界
            unsafe {
                core::ptr::copy_nonoverlapping(kva as *const u8, out[read..].as_mut_ptr(), take);
            }
            read += take;
        }
        Ok(())
    }

    /// 模拟 MMU 检查 `addr` 所在页，返回对应的内核虚拟地址
    fn user_page(&mut self, addr: Vaddr, access: AccessKind) -> MmResult<usize> {
        let vpn = Vpn::from_addr_floor(addr);
        let needed = match access {
            AccessKind::Read => UniversalPTEFlag::READABLE,
            AccessKind::Write => UniversalPTEFlag::WRITEABLE,
            AccessKind::Execute => UniversalPTEFlag::EXECUTABLE,
        } | UniversalPTEFlag::USER_ACCESSIBLE;

        for _ in 0..2 {
            if let Ok((ppn, flags)) = self.page_table.walk(vpn) {
                if flags.contains(needed) {
                    let paddr = ppn.start_addr().as_usize() + addr.page_offset();
                    return Ok(crate::arch_ops().paddr_to_vaddr(paddr));
                }
            }
            self.handle_page_fault(addr, access)?;
        }
        Err(MmError::SegmentationFault)
    }
}

/// 该页当前能否以可写方式安装
pub(super) fn writable_now(region: &Region, vpn: Vpn) -> bool {
    let index = region.page_index(vpn);
    let object = region.object();
    match region.share() {
        ShareMode::Private => !object.is_cow(index),
        ShareMode::Shared => !object.tracks_dirty() || object.is_dirty(index),
    }
}

fn populate_access(perm: MemPerm) -> Option<AccessKind> {
    if perm.contains(MemPerm::READ) {
        Some(AccessKind::Read)
    } else if perm.contains(MemPerm::WRITE) {
        Some(AccessKind::Write)
    } else if perm.contains(MemPerm::EXEC) {
        Some(AccessKind::Execute)
    } else {
        None
    }
}

impl<PT: PageTableInner> Drop for AddressSpace<PT> {
    fn drop(&mut self) {
        let mut batch = TlbBatch::new(self.page_table.root_ppn());
        for region in self.regions.drain() {
            for vpn in region.range() {
                if self.page_table.unmap(vpn).is_ok() {
                    batch.add_page(vpn);
                }
            }
            batch.retire_region(region);
        }
        batch.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_space::BackingObject;
    use crate::test_utils;
    use alloc::string::ToString;

    const PAGE: usize = 4096;
    const RW: MemPerm = MemPerm::READ.union(MemPerm::WRITE);

    fn anon_req(space: &AddressSpace, addr: Option<usize>, pages: usize, fixed: bool, perm: MemPerm) -> MapRequest {
        MapRequest {
            addr: addr.map(Vaddr::new),
            fixed,
            len: pages * PAGE,
            perm,
            may_write: true,
            share: ShareMode::Private,
            object: BackingObject::new_anonymous(space.frames()),
            object_offset: 0,
            name: "[anon]".to_string(),
            populate: false,
        }
    }

    fn anon(space: &mut AddressSpace, addr: Option<usize>, pages: usize, fixed: bool) -> MmResult<Vaddr> {
        let req = anon_req(space, addr, pages, fixed, RW);
        space.mmap(req)
    }

    fn new_space(frames: usize) -> AddressSpace {
        AddressSpace::new(&test_utils::frames(frames)).unwrap()
    }

    fn layout(space: &AddressSpace) -> Vec<(usize, usize, usize)> {
        space
            .regions()
            .map(|r| (r.start().start_addr().as_usize(), r.pages(), r.object_offset()))
            .collect()
    }

    #[test]
    fn test_mmap_places_at_mmap_base() {
        let mut space = new_space(16);
        let a = anon(&mut space, None, 2, false).unwrap();
        let b = anon(&mut space, None, 1, false).unwrap();
        assert_eq!(a.as_usize(), 0x10_0000_0000);
        assert_eq!(b.as_usize(), 0x10_0000_0000 + 2 * PAGE);
        assert_eq!(space.region_count(), 2);
    }

    #[test]
    fn test_mmap_honours_free_hint() {
        let mut space = new_space(16);
        let a = anon(&mut space, Some(0x5000_0000), 1, false).unwrap();
        assert_eq!(a.as_usize(), 0x5000_0000);
        // 提示地址已被占用时另寻空闲区间
        let b = anon(&mut space, Some(0x5000_0000), 1, false).unwrap();
        assert_ne!(b, a);
    }

    #[test]
    fn test_mmap_validation() {
        let mut space = new_space(16);
        assert_eq!(anon(&mut space, None, 0, false), Err(MmError::InvalidArgument));
        assert_eq!(anon(&mut space, Some(0x5000_0001), 1, true), Err(MmError::InvalidArgument));
        // 没有地址的 fixed 请求退化为普通放置
        let base = Vaddr::new(mm_config().mmap_base());
        assert_eq!(anon(&mut space, None, 1, true), Ok(base));
        assert_eq!(space.region_count(), 1);
        space.munmap(base, PAGE).unwrap();
        // 第 0 页不在用户范围内
        assert_eq!(anon(&mut space, Some(0), 1, true), Err(MmError::InvalidArgument));
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn test_fixed_mapping_replaces_overlap() {
        let mut space = new_space(16);
        let base = 0x4000_0000;
        anon(&mut space, Some(base), 4, true).unwrap();
        anon(&mut space, Some(base + PAGE), 2, true).unwrap();
        assert_eq!(
            layout(&space),
            [(base, 1, 0), (base + PAGE, 2, 0), (base + 3 * PAGE, 1, 3)]
        );
    }

    #[test]
    fn test_munmap_classification() {
        let mut space = new_space(16);
        let base = 0x4000_0000;
        anon(&mut space, Some(base), 8, true).unwrap();

        // 内部打洞
        space.munmap(Vaddr::new(base + 3 * PAGE), 2 * PAGE).unwrap();
        // 头部
        space.munmap(Vaddr::new(base), PAGE).unwrap();
        // 尾部
        space.munmap(Vaddr::new(base + 7 * PAGE), PAGE).unwrap();

        assert_eq!(layout(&space), [(base + PAGE, 2, 1), (base + 5 * PAGE, 2, 5)]);
        // 拆分出的两半仍共享同一对象
        let objects: Vec<_> = space.regions().map(|r| r.object().as_ptr()).collect();
        assert_eq!(objects[0], objects[1]);
    }

    #[test]
    fn test_munmap_of_hole_is_noop() {
        let mut space = new_space(16);
        let before = space.free_ranges();
        assert_eq!(space.munmap(Vaddr::new(0x7000_0000), 4 * PAGE), Ok(()));
        assert_eq!(space.free_ranges(), before);
        assert_eq!(space.munmap(Vaddr::new(0x7000_0001), PAGE), Err(MmError::InvalidArgument));
        assert_eq!(space.munmap(Vaddr::new(0x7000_0000), 0), Err(MmError::InvalidArgument));
    }

    #[test]
    fn test_munmap_returns_frames() {
        let frames = test_utils::frames(32);
        let mut space = AddressSpace::<Sv39PageTable>::new(&frames).unwrap();
        let base = Vaddr::new(0x4000_0000);
        anon(&mut space, Some(base.as_usize()), 4, true).unwrap();
        space.copy_to_user(base, &[1u8; 4 * PAGE]).unwrap();
        let with_data = frames.allocated_frames();

        space.munmap(base, 2 * PAGE).unwrap();
        assert_eq!(frames.allocated_frames(), with_data - 2);
        space.munmap(base.checked_add(2 * PAGE).unwrap(), 2 * PAGE).unwrap();
        assert_eq!(frames.allocated_frames(), with_data - 4);
    }

    #[test]
    fn test_mprotect_splits_and_coalesces() {
        let mut space = new_space(16);
        let base = 0x4000_0000;
        anon(&mut space, Some(base), 4, true).unwrap();

        space.mprotect(Vaddr::new(base + PAGE), 2 * PAGE, MemPerm::READ).unwrap();
        let perms: Vec<_> = space.regions().map(|r| (r.pages(), r.perm())).collect();
        assert_eq!(perms, [(1, RW), (2, MemPerm::READ), (1, RW)]);

        space.mprotect(Vaddr::new(base + PAGE), 2 * PAGE, RW).unwrap();
        assert_eq!(layout(&space), [(base, 4, 0)]);
    }

    #[test]
    fn test_mprotect_requires_full_coverage() {
        let mut space = new_space(16);
        let base = 0x4000_0000;
        anon(&mut space, Some(base), 1, true).unwrap();
        anon(&mut space, Some(base + 2 * PAGE), 1, true).unwrap();
        assert_eq!(
            space.mprotect(Vaddr::new(base), 3 * PAGE, MemPerm::READ),
            Err(MmError::InvalidRange)
        );
        assert_eq!(
            space.mprotect(Vaddr::new(0x7000_0000), PAGE, MemPerm::READ),
            Err(MmError::InvalidRange)
        );
        // 失败时不做任何修改
        assert!(space.regions().all(|r| r.perm() == RW));
    }

    #[test]
    fn test_mprotect_rejects_write_beyond_may_write() {
        let mut space = new_space(16);
        let mut req = anon_req(&space, Some(0x4000_0000), 1, true, MemPerm::READ);
        req.may_write = false;
        let addr = space.mmap(req).unwrap();
        assert_eq!(space.mprotect(addr, PAGE, RW), Err(MmError::PermissionDenied));
        assert_eq!(space.mprotect(addr, PAGE, MemPerm::empty()), Ok(()));
    }

    #[test]
    fn test_mprotect_reinstalls_present_ptes() {
        let mut space = new_space(32);
        let base = Vaddr::new(0x4000_0000);
        anon(&mut space, Some(base.as_usize()), 1, true).unwrap();
        space.copy_to_user(base, b"x").unwrap();

        space.mprotect(base, PAGE, MemPerm::READ).unwrap();
        let (_, flags) = space.page_table().walk(Vpn::from_addr_floor(base)).unwrap();
        assert!(!flags.contains(UniversalPTEFlag::WRITEABLE));
        assert_eq!(space.copy_to_user(base, b"y"), Err(MmError::SegmentationFault));

        space.mprotect(base, PAGE, MemPerm::empty()).unwrap();
        assert!(space.page_table().walk(Vpn::from_addr_floor(base)).is_err());
        let mut buf = [0u8; 1];
        assert_eq!(space.copy_from_user(base, &mut buf), Err(MmError::SegmentationFault));

        // 恢复权限后内容仍在
        space.mprotect(base, PAGE, MemPerm::READ).unwrap();
        space.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_free_ranges_round_trip() {
        let mut space = new_space(16);
        let before = space.free_ranges();
        let a = anon(&mut space, None, 3, false).unwrap();
        let b = anon(&mut space, Some(0x2000_0000), 2, true).unwrap();
        assert_ne!(space.free_ranges(), before);
        space.munmap(b, 2 * PAGE).unwrap();
        space.munmap(a, 3 * PAGE).unwrap();
        assert_eq!(space.free_ranges(), before);
    }

    #[test]
    fn test_populate_rolls_back_on_oom() {
        // 根页表 + 两级中间表 + 2 个数据页
        let mut space = new_space(5);
        let mut req = anon_req(&space, None, 8, false, MemPerm::READ);
        req.populate = true;
        assert_eq!(space.mmap(req), Err(MmError::OutOfMemory));
        assert_eq!(space.region_count(), 0);
        assert_eq!(space.free_ranges().len(), 1);
        assert_eq!(space.frames().allocated_frames(), 3);
    }

    #[test]
    fn test_drop_releases_everything() {
        let frames = test_utils::frames(32);
        {
            let mut space = AddressSpace::<Sv39PageTable>::new(&frames).unwrap();
            let addr = anon(&mut space, None, 4, false).unwrap();
            space.copy_to_user(addr, &[7u8; 3 * PAGE]).unwrap();
            assert!(frames.allocated_frames() > 3);
        }
        assert_eq!(frames.allocated_frames(), 0);
    }
}
