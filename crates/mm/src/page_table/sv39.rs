//! RISC-V Sv39 三级页表
//!
//! 每级页表占一个 4K 帧，含 512 个 8 字节页表项。虚拟页号按
//! `[26:18] [17:9] [8:0]` 拆为三级索引。仅建立 4K 叶子映射，
//! 遇到大页叶子视为无效地址。

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{PageTableEntry, PageTableInner, PagingError, PagingResult, Sv39Pte, UniversalPTEFlag};
use crate::address::{PageNum, Ppn, UsizeConvert, Vpn};
use crate::frame_allocator::{FrameAllocator, FrameTracker};

const ENTRIES_PER_TABLE: usize = 512;
const INDEX_BITS: usize = 9;
/// Sv39 用户半区可表示的虚拟页数（VA < 2^38）
const USER_VPN_LIMIT: usize = 1 << 26;

/// Sv39 页表
pub struct Sv39PageTable {
    root: FrameTracker,
    /// 中间级页表帧，随页表一起释放
    tables: Vec<FrameTracker>,
    frames: Arc<FrameAllocator>,
}

impl Sv39PageTable {
    fn indexes(vpn: Vpn) -> [usize; 3] {
        let v = vpn.as_usize();
        [
            (v >> (2 * INDEX_BITS)) & (ENTRIES_PER_TABLE - 1),
            (v >> INDEX_BITS) & (ENTRIES_PER_TABLE - 1),
            v & (ENTRIES_PER_TABLE - 1),
        ]
    }

    fn entry_ptr(table: Ppn, index: usize) -> *mut Sv39Pte {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let base = table.start_addr().to_kernel_vaddr().as_usize() as *mut Sv39Pte;
        // SAFETY: 页表帧经直接映射可访问，index 在 512 以内
        unsafe { base.add(index) }
    }

    fn read(ptr: *mut Sv39Pte) -> Sv39Pte {
        // SAFETY: ptr 来自 entry_ptr
        unsafe { ptr.read_volatile() }
    }

    fn write(ptr: *mut Sv39Pte, pte: Sv39Pte) {
        // SAFETY: ptr 来自 entry_ptr，写入在地址空间锁内进行
        unsafe { ptr.write_volatile(pte) }
    }

    /// 找到叶子项的位置，`create` 为真时补齐缺失的中间级页表
    fn find_pte(&mut self, vpn: Vpn, create: bool) -> PagingResult<Option<*mut Sv39Pte>> {
        if vpn.as_usize() >= USER_VPN_LIMIT {
            return Err(PagingError::InvalidAddress);
        }
        let idx = Self::indexes(vpn);
        let mut table = self.root.ppn();
        for (level, &i) in idx.iter().enumerate() {
            let ptr = Self::entry_ptr(table, i);
            if level == idx.len() - 1 {
                return Ok(Some(ptr));
            }
            let pte = Self::read(ptr);
            if !pte.is_valid() {
                if !create {
                    return Ok(None);
                }
                let frame = self
                    .frames
                    .allocate_zeroed()
                    .map_err(|_| PagingError::FrameAllocFailed)?;
                Self::write(ptr, Sv39Pte::new(frame.ppn(), UniversalPTEFlag::VALID));
                table = frame.ppn();
                self.tables.push(frame);
            } else if pte.is_leaf() {
                return Err(PagingError::InvalidAddress);
            } else {
                table = pte.ppn();
            }
        }
        Ok(None)
    }

    fn leaf(&self, vpn: Vpn) -> PagingResult<Option<Sv39Pte>> {
        if vpn.as_usize() >= USER_VPN_LIMIT {
            return Err(PagingError::InvalidAddress);
        }
        let idx = Self::indexes(vpn);
        let mut table = self.root.ppn();
        for &i in &idx[..2] {
            let pte = Self::read(Self::entry_ptr(table, i));
            if !pte.is_valid() {
                return Ok(None);
            }
            if pte.is_leaf() {
                return Err(PagingError::InvalidAddress);
            }
            table = pte.ppn();
        }
        Ok(Some(Self::read(Self::entry_ptr(table, idx[2]))))
    }

    fn existing_leaf(&mut self, vpn: Vpn) -> PagingResult<*mut Sv39Pte> {
        let ptr = self.find_pte(vpn, false)?.ok_or(PagingError::NotMapped)?;
        if !Self::read(ptr).is_valid() {
            return Err(PagingError::NotMapped);
        }
        Ok(ptr)
    }

    fn check_leaf_flags(flags: UniversalPTEFlag) -> PagingResult<()> {
        // Sv39 保留 W 而无 R 的组合
        if !flags.is_leaf()
            || (flags.contains(UniversalPTEFlag::WRITEABLE)
                && !flags.contains(UniversalPTEFlag::READABLE))
        {
            return Err(PagingError::InvalidFlags);
        }
        Ok(())
    }

    /// 页表帧数量（含根页表）
    pub fn table_frames(&self) -> usize {
        self.tables.len() + 1
    }
}

impl PageTableInner for Sv39PageTable {
    type Entry = Sv39Pte;

    const LEVELS: usize = 3;
    const MAX_VA_BITS: usize = 39;

    fn new(frames: &Arc<FrameAllocator>) -> PagingResult<Self> {
        debug_assert_eq!(crate::mm_config().page_size(), 4096);
        let root = frames
            .allocate_zeroed()
            .map_err(|_| PagingError::FrameAllocFailed)?;
        Ok(Self {
            root,
            tables: Vec::new(),
            frames: frames.clone(),
        })
    }

    fn root_ppn(&self) -> Ppn {
        self.root.ppn()
    }

    fn get_entry(&self, vpn: Vpn) -> Option<Sv39Pte> {
        self.leaf(vpn).ok().flatten()
    }

    fn map(&mut self, vpn: Vpn, ppn: Ppn, flags: UniversalPTEFlag) -> PagingResult<()> {
        Self::check_leaf_flags(flags)?;
        let ptr = self
            .find_pte(vpn, true)?
            .ok_or(PagingError::InvalidAddress)?;
        if Self::read(ptr).is_valid() {
            return Err(PagingError::AlreadyMapped);
        }
        Self::write(ptr, Sv39Pte::new(ppn, flags | UniversalPTEFlag::VALID));
        Ok(())
    }

    fn unmap(&mut self, vpn: Vpn) -> PagingResult<Ppn> {
        let ptr = self.existing_leaf(vpn)?;
        let old = Self::read(ptr);
        Self::write(ptr, Sv39Pte::empty());
        Ok(old.ppn())
    }

    fn mvmap(&mut self, vpn: Vpn, target_ppn: Ppn, flags: UniversalPTEFlag) -> PagingResult<()> {
        Self::check_leaf_flags(flags)?;
        let ptr = self.existing_leaf(vpn)?;
        Self::write(ptr, Sv39Pte::new(target_ppn, flags | UniversalPTEFlag::VALID));
        Ok(())
    }

    fn update_flags(&mut self, vpn: Vpn, flags: UniversalPTEFlag) -> PagingResult<()> {
        Self::check_leaf_flags(flags)?;
        let ptr = self.existing_leaf(vpn)?;
        let ppn = Self::read(ptr).ppn();
        Self::write(ptr, Sv39Pte::new(ppn, flags | UniversalPTEFlag::VALID));
        Ok(())
    }

    fn walk(&self, vpn: Vpn) -> PagingResult<(Ppn, UniversalPTEFlag)> {
        match self.leaf(vpn)? {
            Some(pte) if pte.is_valid() => Ok((pte.ppn(), pte.flags())),
            _ => Err(PagingError::NotMapped),
        }
    }
}
