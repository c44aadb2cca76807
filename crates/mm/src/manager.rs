//! 内存管理器
//!
//! [`MemoryManager`] 是系统调用层与缺页入口面对的唯一接口：按 [`Asid`] 管理
//! 所有地址空间，把 POSIX 风格的参数（[`ProtFlags`]、[`MapFlags`]、文件与偏移）
//! 校验后转换成 [`MapRequest`]，并维护共享文件映射的后备对象缓存。
//!
//! # 锁顺序
//!
//! 地址空间表（读写锁）→ 单个地址空间 → 后备对象 → 帧分配器。
//! 共享文件缓存有自己的锁，持有它时不会再去获取任何地址空间的锁。
//!
//! # 限制
//!
//! 地址空间锁是关中断的 [`SpinLock`]。缺页时的文件读入，以及 munmap 释放
//! 最后一个共享文件映射时的写回，都在持有该锁期间同步调用 [`MmInode`]，
//! 因此文件系统操作不能在其中让出 CPU；等待 I/O 的线程会一直占着本 CPU。
//! 销毁地址空间时写回发生在锁外（最后一个句柄被 drop 时）。

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use sync::{RwLock, SpinLock};
use uapi::mm::{MapFlags, MsyncFlags, ProtFlags};

use crate::address::{UsizeConvert, Vaddr};
use crate::error::{MmError, MmResult};
use crate::file::{MmFile, MmInode};
use crate::frame_allocator::FrameAllocator;
use crate::memory_space::{
    AccessKind, AddressSpace, BackingObject, FaultOutcome, MapRequest, MemPerm, ObjectRef,
    RegionInfo, ShareMode,
};
use crate::mm_config;
use crate::page_table::{PageTableInner, Sv39PageTable};

/// 地址空间标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(pub usize);

/// 地址空间句柄，调用者持锁操作
pub type SpaceHandle<PT> = Arc<SpinLock<AddressSpace<PT>>>;

/// 内存管理器
pub struct MemoryManager<PT: PageTableInner = Sv39PageTable> {
    frames: Arc<FrameAllocator>,
    spaces: RwLock<BTreeMap<Asid, SpaceHandle<PT>>>,
    next_asid: AtomicUsize,
    /// 文件身份 → 共享映射后备对象
    shared_files: SpinLock<BTreeMap<u64, Weak<BackingObject>>>,
}

impl<PT: PageTableInner> MemoryManager<PT> {
    /// 创建管理器，所有帧从 `frames` 分配
    pub fn new(frames: Arc<FrameAllocator>) -> Self {
        Self {
            frames,
            spaces: RwLock::new(BTreeMap::new()),
            next_asid: AtomicUsize::new(1),
            shared_files: SpinLock::new(BTreeMap::new()),
        }
    }

    /// 物理帧分配器
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    fn insert_space(&self, space: AddressSpace<PT>) -> Asid {
        let asid = Asid(self.next_asid.fetch_add(1, Ordering::Relaxed));
        self.spaces
            .write()
            .insert(asid, Arc::new(SpinLock::new(space)));
        asid
    }

    /// 创建一个空地址空间
    pub fn create_address_space(&self) -> MmResult<Asid> {
        let space = AddressSpace::new(&self.frames)?;
        let asid = self.insert_space(space);
        log::debug!("mm: created address space {:?}", asid);
        Ok(asid)
    }

    /// 销毁地址空间
    ///
    /// 仍被其他持有者（例如正在处理缺页的 CPU）引用的地址空间在最后一个
    /// 句柄释放时拆除。
    pub fn destroy_address_space(&self, asid: Asid) -> MmResult<()> {
        let space = self
            .spaces
            .write()
            .remove(&asid)
            .ok_or(MmError::InvalidArgument)?;
        log::debug!("mm: destroyed address space {:?}", asid);
        drop(space);
        Ok(())
    }

    /// 以写时复制方式复制地址空间
    pub fn fork_address_space(&self, parent: Asid) -> MmResult<Asid> {
        let child = self.space(parent)?.lock().fork()?;
        let asid = self.insert_space(child);
        log::debug!("mm: forked {:?} -> {:?}", parent, asid);
        Ok(asid)
    }

    /// 取得地址空间句柄
    pub fn space(&self, asid: Asid) -> MmResult<SpaceHandle<PT>> {
        self.spaces
            .read()
            .get(&asid)
            .cloned()
            .ok_or(MmError::InvalidArgument)
    }

    /// 地址空间个数
    pub fn space_count(&self) -> usize {
        self.spaces.read().len()
    }

    /// 地址空间中所有区域的快照
    pub fn regions(&self, asid: Asid) -> MmResult<Vec<RegionInfo>> {
        Ok(self.space(asid)?.lock().snapshot())
    }

    /// 建立映射，返回起始地址
    ///
    /// `addr` 为 0 表示由内核选择地址，带 `MAP_FIXED` 时也一样；
    /// 非 `MAP_FIXED` 时非零地址仅作提示。
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        asid: Asid,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        file: Option<&dyn MmFile>,
        offset: usize,
    ) -> MmResult<usize> {
        let share = match flags & MapFlags::TYPE_MASK {
            t if t == MapFlags::SHARED => ShareMode::Shared,
            t if t == MapFlags::PRIVATE => ShareMode::Private,
            _ => return Err(MmError::InvalidArgument),
        };
        let page_size = mm_config().page_size();
        if len == 0 || offset % page_size != 0 {
            return Err(MmError::InvalidArgument);
        }
        offset.checked_add(len).ok_or(MmError::InvalidArgument)?;
        let fixed = flags.contains(MapFlags::FIXED);
        if fixed && addr % page_size != 0 {
            return Err(MmError::InvalidArgument);
        }

        let (object, object_offset, may_write, name) = if flags.contains(MapFlags::ANONYMOUS) {
            let name = match share {
                ShareMode::Private => "[anon]",
                ShareMode::Shared => "[anon:shared]",
            };
            (BackingObject::new_anonymous(&self.frames), 0, true, name.to_string())
        } else {
            let file = file.ok_or(MmError::InvalidArgument)?;
            if !file.readable() {
                return Err(MmError::PermissionDenied);
            }
            let inode = file.inode().map_err(|errno| {
                log::debug!("mmap: file has no inode: errno {}", errno);
                MmError::InvalidArgument
            })?;
            let name = file_tag(inode.as_ref());
            match share {
                ShareMode::Shared => {
                    if prot.contains(ProtFlags::WRITE) && !file.writable() {
                        return Err(MmError::PermissionDenied);
                    }
                    let object = self.shared_file_object(inode);
                    (object, offset / page_size, file.writable(), name)
                }
                ShareMode::Private => {
                    let object = BackingObject::new_file(&self.frames, inode, offset, false);
                    (object, 0, true, name)
                }
            }
        };

        let req = MapRequest {
            addr: (addr != 0).then(|| Vaddr::new(addr)),
            fixed,
            len,
            perm: MemPerm::from(prot),
            may_write,
            share,
            object,
            object_offset,
            name,
            populate: flags.contains(MapFlags::POPULATE),
        };
        let start = self.space(asid)?.lock().mmap(req)?;
        Ok(start.as_usize())
    }

    /// 同一文件的共享映射使用同一个后备对象
    fn shared_file_object(&self, inode: Arc<dyn MmInode>) -> ObjectRef {
        let identity = inode.identity();
        let mut cache = self.shared_files.lock();
        if let Some(object) = cache
            .get(&identity)
            .and_then(Weak::upgrade)
            .and_then(|object| ObjectRef::try_share(&object))
        {
            return object;
        }
        cache.retain(|_, weak| weak.strong_count() > 0);
        let object = BackingObject::new_file(&self.frames, inode, 0, true);
        cache.insert(identity, object.downgrade());
        log::trace!("mm: new shared object for inode {}", identity);
        object
    }

    /// 解除映射
    pub fn munmap(&self, asid: Asid, addr: usize, len: usize) -> MmResult<()> {
        self.space(asid)?.lock().munmap(Vaddr::new(addr), len)
    }

    /// 修改访问权限
    pub fn mprotect(&self, asid: Asid, addr: usize, len: usize, prot: ProtFlags) -> MmResult<()> {
        self.space(asid)?
            .lock()
            .mprotect(Vaddr::new(addr), len, MemPerm::from(prot))
    }

    /// 写回共享文件映射的脏页
    ///
    /// `MS_ASYNC` 与 `MS_SYNC` 不能同时指定；两者都按同步写回处理。
    pub fn msync(&self, asid: Asid, addr: usize, len: usize, flags: MsyncFlags) -> MmResult<()> {
        if flags.contains(MsyncFlags::ASYNC | MsyncFlags::SYNC) {
            return Err(MmError::InvalidArgument);
        }
        self.space(asid)?.lock().msync(Vaddr::new(addr), len)
    }

    /// 处理缺页
    pub fn handle_page_fault(
        &self,
        asid: Asid,
        addr: usize,
        access: AccessKind,
    ) -> MmResult<FaultOutcome> {
        self.space(asid)?
            .lock()
            .handle_page_fault(Vaddr::new(addr), access)
    }

    /// 向用户地址写入数据
    pub fn copy_to_user(&self, asid: Asid, addr: usize, data: &[u8]) -> MmResult<()> {
        self.space(asid)?.lock().copy_to_user(Vaddr::new(addr), data)
    }

    /// 从用户地址读取数据
    pub fn copy_from_user(&self, asid: Asid, addr: usize, out: &mut [u8]) -> MmResult<()> {
        self.space(asid)?
            .lock()
            .copy_from_user(Vaddr::new(addr), out)
    }
}

fn file_tag(inode: &dyn MmInode) -> String {
    alloc::format!("[file:{}]", inode.identity())
}

lazy_static! {
    /// 全局内存管理器，由 [`init_memory_manager`] 初始化
    static ref MEMORY_MANAGER: SpinLock<Option<Arc<MemoryManager>>> = SpinLock::new(None);
}

/// 用 `[start_addr, end_addr)` 的物理内存初始化全局内存管理器
///
/// 重复调用会替换之前的实例；已取得的句柄不受影响。
pub fn init_memory_manager(start_addr: usize, end_addr: usize) {
    let frames = FrameAllocator::new(start_addr, end_addr);
    log::info!(
        "mm: {} frames available in [{:#x}, {:#x})",
        frames.total_frames(),
        start_addr,
        end_addr
    );
    *MEMORY_MANAGER.lock() = Some(Arc::new(MemoryManager::new(frames)));
}

/// 获取全局内存管理器
///
/// # Panics
/// 尚未调用 [`init_memory_manager`] 时 panic
pub fn memory_manager() -> Arc<MemoryManager> {
    match MEMORY_MANAGER.lock().as_ref() {
        Some(mm) => mm.clone(),
        None => panic!("mm: MemoryManager not initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, TestInode};
    use test_support::mock::fs::MockInode;

    const PAGE: usize = 4096;

    struct TestFile {
        inode: Arc<MockInode>,
        readable: bool,
        writable: bool,
    }

    impl MmFile for TestFile {
        fn inode(&self) -> Result<Arc<dyn MmInode>, isize> {
            Ok(TestInode::wrap(&self.inode))
        }

        fn readable(&self) -> bool {
            self.readable
        }

        fn writable(&self) -> bool {
            self.writable
        }
    }

    fn manager(pages: usize) -> (MemoryManager, Asid) {
        let mm: MemoryManager = MemoryManager::new(test_utils::frames(pages));
        let asid = mm.create_address_space().unwrap();
        (mm, asid)
    }

    const RW: ProtFlags = ProtFlags::READ.union(ProtFlags::WRITE);
    const ANON: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    #[test]
    fn test_mmap_flag_validation() {
        let (mm, asid) = manager(16);
        let both = MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS;
        assert_eq!(
            mm.mmap(asid, 0, PAGE, RW, both, None, 0),
            Err(MmError::InvalidArgument)
        );
        assert_eq!(
            mm.mmap(asid, 0, PAGE, RW, MapFlags::ANONYMOUS, None, 0),
            Err(MmError::InvalidArgument)
        );
        assert_eq!(mm.mmap(asid, 0, 0, RW, ANON, None, 0), Err(MmError::InvalidArgument));
        assert_eq!(
            mm.mmap(asid, 0x1234, PAGE, RW, ANON | MapFlags::FIXED, None, 0),
            Err(MmError::InvalidArgument)
        );
        // 空地址的 MAP_FIXED 由内核选址
        let picked = mm.mmap(asid, 0, PAGE, RW, ANON | MapFlags::FIXED, None, 0).unwrap();
        assert_eq!(picked % PAGE, 0);
        mm.munmap(asid, picked, PAGE).unwrap();
        // 文件映射缺少文件
        assert_eq!(
            mm.mmap(asid, 0, PAGE, RW, MapFlags::PRIVATE, None, 0),
            Err(MmError::InvalidArgument)
        );
        assert_eq!(
            mm.mmap(Asid(999), 0, PAGE, RW, ANON, None, 0),
            Err(MmError::InvalidArgument)
        );
    }

    #[test]
    fn test_mmap_anonymous_and_fault() {
        let (mm, asid) = manager(16);
        let addr = mm.mmap(asid, 0, 3 * PAGE, RW, ANON, None, 0).unwrap();
        assert_eq!(addr, test_support::mock::mm::MOCK_MM_CONFIG.mmap_base());
        assert_eq!(
            mm.handle_page_fault(asid, addr + PAGE, AccessKind::Write),
            Ok(FaultOutcome::DemandZero)
        );
        assert_eq!(
            mm.handle_page_fault(asid, addr + 3 * PAGE, AccessKind::Read),
            Err(MmError::SegmentationFault)
        );
        let regions = mm.regions(asid).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name, "[anon]");
        assert_eq!(regions[0].len(), 3 * PAGE);
    }

    #[test]
    fn test_file_permission_checks() {
        let (mm, asid) = manager(16);
        let inode = MockInode::with_pattern(2, PAGE, 0);
        let ro = TestFile {
            inode: inode.clone(),
            readable: true,
            writable: false,
        };
        let wo = TestFile {
            inode,
            readable: false,
            writable: true,
        };

        assert_eq!(
            mm.mmap(asid, 0, PAGE, RW, MapFlags::SHARED, Some(&ro), 0),
            Err(MmError::PermissionDenied)
        );
        assert_eq!(
            mm.mmap(asid, 0, PAGE, ProtFlags::READ, MapFlags::PRIVATE, Some(&wo), 0),
            Err(MmError::PermissionDenied)
        );
        // 私有映射写入不会回到文件，只读打开也允许
        mm.mmap(asid, 0, PAGE, RW, MapFlags::PRIVATE, Some(&ro), 0)
            .unwrap();
        // 只读共享映射之后不能再获得写权限
        let addr = mm
            .mmap(asid, 0, PAGE, ProtFlags::READ, MapFlags::SHARED, Some(&ro), 0)
            .unwrap();
        assert_eq!(
            mm.mprotect(asid, addr, PAGE, RW),
            Err(MmError::PermissionDenied)
        );
        assert_eq!(
            mm.mmap(asid, 0, PAGE, ProtFlags::READ, MapFlags::SHARED, Some(&ro), 100),
            Err(MmError::InvalidArgument)
        );
    }

    #[test]
    fn test_shared_file_object_reused_across_spaces() {
        let (mm, a) = manager(32);
        let b = mm.create_address_space().unwrap();
        let inode = MockInode::with_pattern(4, PAGE, 0x22);
        let file = TestFile {
            inode: inode.clone(),
            readable: true,
            writable: true,
        };
        let flags = MapFlags::SHARED;
        let addr_a = mm.mmap(a, 0, 4 * PAGE, RW, flags, Some(&file), 0).unwrap();
        let addr_b = mm
            .mmap(b, 0, 2 * PAGE, RW, flags, Some(&file), 2 * PAGE)
            .unwrap();

        mm.copy_to_user(a, addr_a + 2 * PAGE + 1, b"shared").unwrap();
        let mut buf = [0u8; 6];
        mm.copy_from_user(b, addr_b + 1, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        mm.msync(a, addr_a, 4 * PAGE, MsyncFlags::SYNC).unwrap();
        assert_eq!(&inode.snapshot()[2 * PAGE + 1..2 * PAGE + 7], b"shared");
        assert_eq!(
            mm.msync(a, addr_a, PAGE, MsyncFlags::SYNC | MsyncFlags::ASYNC),
            Err(MmError::InvalidArgument)
        );
    }

    #[test]
    fn test_shared_object_released_after_last_unmap() {
        let (mm, asid) = manager(32);
        let inode = MockInode::with_pattern(1, PAGE, 0);
        let file = TestFile {
            inode: inode.clone(),
            readable: true,
            writable: true,
        };
        let addr = mm
            .mmap(asid, 0, PAGE, RW, MapFlags::SHARED, Some(&file), 0)
            .unwrap();
        mm.copy_to_user(asid, addr, b"bye").unwrap();
        mm.munmap(asid, addr, PAGE).unwrap();
        // 最后一个区域释放时写回脏页
        assert_eq!(&inode.snapshot()[..3], b"bye");

        let again = mm
            .mmap(asid, 0, PAGE, ProtFlags::READ, MapFlags::SHARED, Some(&file), 0)
            .unwrap();
        let mut buf = [0u8; 3];
        mm.copy_from_user(asid, again, &mut buf).unwrap();
        assert_eq!(&buf, b"bye");
    }

    #[test]
    fn test_fork_and_destroy() {
        let (mm, parent) = manager(32);
        let addr = mm.mmap(parent, 0, 2 * PAGE, RW, ANON, None, 0).unwrap();
        mm.copy_to_user(parent, addr, b"before").unwrap();
        let child = mm.fork_address_space(parent).unwrap();
        mm.copy_to_user(child, addr, b"child!").unwrap();

        let mut buf = [0u8; 6];
        mm.copy_from_user(parent, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"before");

        let used = mm.frames().allocated_frames();
        mm.destroy_address_space(child).unwrap();
        assert!(mm.frames().allocated_frames() < used);
        assert_eq!(mm.destroy_address_space(child), Err(MmError::InvalidArgument));
        assert_eq!(mm.space_count(), 1);
    }
}
