//! 缺页处理
//!
//! 缺页按以下状态分类：
//!
//! - `Unmapped`：地址不属于任何区域，段错误
//! - `ProtectionViolation`：区域权限不允许该访问，段错误
//! - `NotPresent`：页表项缺失，填充后备对象槽并安装
//! - `WriteProtected`：页已映射但只读，而区域可写；私有区域打破写时复制，
//!   共享文件区域记录脏页后放开写权限
//! - `Present`：页表已满足访问（其他 CPU 已处理或 TLB 陈旧），只刷新本地 TLB
//!
//! 内存不足与文件 I/O 错误原样返回给触发缺页的上下文，由调度器决定后续策略。

use super::region::{AccessKind, Region, ShareMode};
use super::space::{writable_now, AddressSpace};
use super::tlb::TlbBatch;
use crate::address::{PageNum, Ppn, Vaddr, Vpn};
use crate::arch_ops::arch_ops;
use crate::error::{MmError, MmResult};
use crate::page_table::{PageTableInner, UniversalPTEFlag};

/// 缺页的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// 地址未映射
    Unmapped,
    /// 违反区域权限
    ProtectionViolation,
    /// 页表项缺失
    NotPresent,
    /// 已映射但只读，区域允许写
    WriteProtected,
    /// 页表项已满足访问
    Present,
}

/// 缺页的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 分配清零页
    DemandZero,
    /// 从文件读入
    PageIn,
    /// 槽已填充，只安装页表项
    Mapped,
    /// 打破写时复制
    CopyOnWrite,
    /// 共享文件页首次写入，记录脏页并放开写权限
    WriteEnabled,
    /// 无需处理
    Spurious,
}

impl<PT: PageTableInner> AddressSpace<PT> {
    /// 对 `addr` 处的 `access` 访问进行分类
    pub fn classify_fault(&self, addr: Vaddr, access: AccessKind) -> FaultState {
        let vpn = Vpn::from_addr_floor(addr);
        let Some(region) = self.regions.find(vpn).and_then(|id| self.regions.get(id)) else {
            return FaultState::Unmapped;
        };
        classify(&self.page_table, region, vpn, access)
    }

    /// 处理 `addr` 处的缺页
    pub fn handle_page_fault(&mut self, addr: Vaddr, access: AccessKind) -> MmResult<FaultOutcome> {
        let vpn = Vpn::from_addr_floor(addr);
        let root = self.page_table.root_ppn();
        let Some(region) = self.regions.find(vpn).and_then(|id| self.regions.get(id)) else {
            log::debug!("page fault: {:?} {:?} unmapped", access, addr);
            return Err(MmError::SegmentationFault);
        };

        let state = classify(&self.page_table, region, vpn, access);
        let outcome = match state {
            FaultState::Unmapped | FaultState::ProtectionViolation => {
                log::debug!(
                    "page fault: {:?} {:?} denied by {:?} region",
                    access,
                    addr,
                    region.perm()
                );
                return Err(MmError::SegmentationFault);
            }
            FaultState::NotPresent => install(&mut self.page_table, region, vpn, access)?,
            FaultState::WriteProtected => {
                enable_write(&mut self.page_table, region, vpn, root)?
            }
            FaultState::Present => {
                arch_ops().flush_tlb_page(root, vpn);
                FaultOutcome::Spurious
            }
        };
        log::trace!("page fault: {:?} {:?} -> {:?}", access, addr, outcome);
        Ok(outcome)
    }
}

fn classify<PT: PageTableInner>(pt: &PT, region: &Region, vpn: Vpn, access: AccessKind) -> FaultState {
    if !region.permissions_allow(access) {
        return FaultState::ProtectionViolation;
    }
    match pt.walk(vpn) {
        Err(_) => FaultState::NotPresent,
        Ok((_, flags))
            if access == AccessKind::Write && !flags.contains(UniversalPTEFlag::WRITEABLE) =>
        {
            FaultState::WriteProtected
        }
        Ok(_) => FaultState::Present,
    }
}

/// 填充槽并安装页表项；写时复制槽在写访问时直接复制
fn install<PT: PageTableInner>(
    pt: &mut PT,
    region: &Region,
    vpn: Vpn,
    access: AccessKind,
) -> MmResult<FaultOutcome> {
    let index = region.page_index(vpn);
    let object = region.object();
    let page = object.populate(index)?;

    let mut outcome = if !page.fresh {
        FaultOutcome::Mapped
    } else if object.is_file_backed() {
        FaultOutcome::PageIn
    } else {
        FaultOutcome::DemandZero
    };

    let mut ppn = page.ppn;
    let mut retired = None;
    if access == AccessKind::Write {
        match region.share() {
            ShareMode::Private if page.cow => {
                (ppn, retired) = object.copy_on_write(index)?;
                outcome = FaultOutcome::CopyOnWrite;
            }
            ShareMode::Shared if object.tracks_dirty() => object.mark_dirty(index),
            _ => {}
        }
    }

    pt.map(vpn, ppn, region.pte_flags(writable_now(region, vpn)))?;
    // 本空间从未映射旧帧，安装完成即可释放
    drop(retired);
    Ok(outcome)
}

/// 写访问命中只读页
fn enable_write<PT: PageTableInner>(
    pt: &mut PT,
    region: &Region,
    vpn: Vpn,
    root: Ppn,
) -> MmResult<FaultOutcome> {
    let index = region.page_index(vpn);
    let object = region.object();
    let mut batch = TlbBatch::new(root);
    let outcome = match region.share() {
        ShareMode::Private => {
            let (ppn, old) = object.copy_on_write(index)?;
            pt.mvmap(vpn, ppn, region.pte_flags(true))?;
            batch.retire_frames(old);
            FaultOutcome::CopyOnWrite
        }
        ShareMode::Shared => {
            object.mark_dirty(index);
            pt.update_flags(vpn, region.pte_flags(true))?;
            FaultOutcome::WriteEnabled
        }
    };
    batch.add_page(vpn);
    batch.flush();
    log::trace!("page fault: write enabled at {:?}", vpn.start_addr());
    Ok(outcome)
}
