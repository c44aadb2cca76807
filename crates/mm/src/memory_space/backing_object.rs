//! 后备对象
//!
//! 后备对象持有一段页槽（按对象内页号索引，从 0 开始），每个槽可选地指向
//! 一个物理帧。区域通过 [`ObjectRef`] 引用对象，并用对象内偏移确定自己看到
//! 的窗口；同一对象可以被多个区域共享（拆分后的两半、共享映射、fork 的共享区域）。
//!
//! ## 写时复制
//!
//! [`BackingObject::fork_for_cow`] 生成的子对象与父对象共享所有已填充的帧，
//! 两边的槽都被标记为写时复制。写入时 [`BackingObject::copy_on_write`] 复制一份
//! 私有帧；若对象已是该帧的唯一持有者，则只清除标记。
//!
//! ## 生命周期
//!
//! 区域计数降为 0 时对象被拆除：共享文件对象先写回脏页，然后释放所有帧。

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, Range};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::address::Ppn;
use crate::error::{MmError, MmResult};
use crate::file::MmInode;
use crate::frame_allocator::{FrameAllocator, FrameTracker};
use sync::SpinLock;

/// 写回失败时的最大尝试次数
const WRITEBACK_ATTEMPTS: usize = 3;

/// 后备对象的种类
#[derive(Clone)]
pub enum ObjectKind {
    /// 匿名内存，首次访问时填零
    Anonymous,
    /// 文件内容，首次访问时从文件读入
    FileBacked {
        /// 文件
        inode: Arc<dyn MmInode>,
        /// 对象第 0 页对应的文件偏移（字节，页对齐）
        offset: usize,
        /// 是否为共享映射（写入需要写回文件）
        shared: bool,
    },
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Anonymous => f.write_str("Anonymous"),
            ObjectKind::FileBacked {
                inode,
                offset,
                shared,
            } => f
                .debug_struct("FileBacked")
                .field("inode", &inode.identity())
                .field("offset", offset)
                .field("shared", shared)
                .finish(),
        }
    }
}

struct Slot {
    frame: FrameTracker,
    cow: bool,
    /// 写过的共享文件页；在对象存活期间保持置位，每次同步都会重新写回
    dirty: bool,
}

/// [`BackingObject::populate`] 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    /// 槽中的物理帧
    pub ppn: Ppn,
    /// 槽是否带写时复制标记
    pub cow: bool,
    /// 本次调用是否新填充了该槽
    pub fresh: bool,
}

/// 后备对象
pub struct BackingObject {
    kind: ObjectKind,
    slots: SpinLock<Vec<Option<Slot>>>,
    /// 引用本对象的区域数
    regions: AtomicUsize,
    frames: Arc<FrameAllocator>,
}

impl BackingObject {
    fn create(frames: &Arc<FrameAllocator>, kind: ObjectKind, slots: Vec<Option<Slot>>) -> ObjectRef {
        ObjectRef(Arc::new(Self {
            kind,
            slots: SpinLock::new(slots),
            regions: AtomicUsize::new(1),
            frames: frames.clone(),
        }))
    }

    /// 创建匿名对象，区域计数为 1
    pub fn new_anonymous(frames: &Arc<FrameAllocator>) -> ObjectRef {
        Self::create(frames, ObjectKind::Anonymous, Vec::new())
    }

    /// 创建文件对象，区域计数为 1
    pub fn new_file(
        frames: &Arc<FrameAllocator>,
        inode: Arc<dyn MmInode>,
        offset: usize,
        shared: bool,
    ) -> ObjectRef {
        Self::create(
            frames,
            ObjectKind::FileBacked {
                inode,
                offset,
                shared,
            },
            Vec::new(),
        )
    }

    /// 对象种类
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// 是否由文件支持
    pub fn is_file_backed(&self) -> bool {
        matches!(self.kind, ObjectKind::FileBacked { .. })
    }

    /// 是否需要跟踪脏页（共享文件对象）
    pub fn tracks_dirty(&self) -> bool {
        matches!(self.kind, ObjectKind::FileBacked { shared: true, .. })
    }

    /// 文件身份标识（匿名对象为 `None`）
    pub fn identity(&self) -> Option<u64> {
        match &self.kind {
            ObjectKind::Anonymous => None,
            ObjectKind::FileBacked { inode, .. } => Some(inode.identity()),
        }
    }

    /// 当前引用本对象的区域数
    pub fn region_count(&self) -> usize {
        self.regions.load(Ordering::Acquire)
    }

    /// 已填充的槽数
    pub fn populated_pages(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// 槽 `index` 中的帧
    pub fn frame_at(&self, index: usize) -> Option<Ppn> {
        self.with_slot(index, |s| s.frame.ppn())
    }

    /// 槽 `index` 是否带写时复制标记
    pub fn is_cow(&self, index: usize) -> bool {
        self.with_slot(index, |s| s.cow).unwrap_or(false)
    }

    /// 槽 `index` 是否被写过
    pub fn is_dirty(&self, index: usize) -> bool {
        self.with_slot(index, |s| s.dirty).unwrap_or(false)
    }

    fn with_slot<R>(&self, index: usize, f: impl FnOnce(&Slot) -> R) -> Option<R> {
        self.slots.lock().get(index).and_then(Option::as_ref).map(f)
    }

    /// 确保槽 `index` 已填充，返回其状态
    ///
    /// 匿名对象分配清零帧，文件对象从文件读入。文件 I/O 期间不持有对象锁；
    /// 若并发的填充先完成，保留先安装的帧。
    pub fn populate(&self, index: usize) -> MmResult<PageState> {
        if let Some(state) = self.with_slot(index, |s| PageState {
            ppn: s.frame.ppn(),
            cow: s.cow,
            fresh: false,
        }) {
            return Ok(state);
        }

        let frame = match &self.kind {
            ObjectKind::Anonymous => self.frames.allocate_zeroed()?,
            ObjectKind::FileBacked { inode, offset, .. } => {
                self.read_page(inode.as_ref(), offset + index * page_size())?
            }
        };

        let mut slots = self.slots.lock();
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        match &slots[index] {
            Some(existing) => {
                let state = PageState {
                    ppn: existing.frame.ppn(),
                    cow: existing.cow,
                    fresh: false,
                };
                drop(slots);
                drop(frame);
                Ok(state)
            }
            None => {
                let ppn = frame.ppn();
                slots[index] = Some(Slot {
                    frame,
                    cow: false,
                    dirty: false,
                });
                Ok(PageState {
                    ppn,
                    cow: false,
                    fresh: true,
                })
            }
        }
    }

    fn read_page(&self, inode: &dyn MmInode, file_offset: usize) -> MmResult<FrameTracker> {
        let mut frame = self.frames.allocate()?;
        let buf = frame.as_mut_slice();
        let mut filled = 0;
        while filled < buf.len() {
            match inode.read_at(file_offset + filled, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(errno) => {
                    log::error!(
                        "page-in: read of inode {} at {:#x} failed: errno {}",
                        inode.identity(),
                        file_offset + filled,
                        errno
                    );
                    return Err(MmError::IoFailure);
                }
            }
        }
        if filled < buf.len() {
            if file_offset + filled < inode.size() {
                log::warn!(
                    "Partial read at offset {:#x}: expected {}, got {}",
                    file_offset,
                    buf.len(),
                    filled
                );
            }
            buf[filled..].fill(0);
        }
        Ok(frame)
    }

    /// 打破槽 `index` 的写时复制，返回可写入的帧
    ///
    /// 帧仍被其他对象共享时复制一份新帧，并把旧帧的引用交还调用者；
    /// 调用者须在替换页表项并完成 TLB 失效后再释放它。
    /// 本对象已是唯一持有者时只清除标记。
    pub fn copy_on_write(&self, index: usize) -> MmResult<(Ppn, Option<FrameTracker>)> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(index).and_then(Option::as_mut) else {
            drop(slots);
            return self.populate(index).map(|s| (s.ppn, None));
        };
        if !slot.cow {
            return Ok((slot.frame.ppn(), None));
        }
        if slot.frame.ref_count() == 1 {
            slot.cow = false;
            log::trace!("cow: slot {} already exclusive", index);
            return Ok((slot.frame.ppn(), None));
        }

        let copy = self.frames.allocate()?;
        copy.copy_from(&slot.frame);
        let old = core::mem::replace(&mut slot.frame, copy);
        slot.cow = false;
        let ppn = slot.frame.ppn();
        drop(slots);
        log::trace!("cow: slot {} copied {:?} -> {:?}", index, old.ppn(), ppn);
        Ok((ppn, Some(old)))
    }

    /// 记录槽 `index` 被写入
    pub fn mark_dirty(&self, index: usize) {
        if let Some(slot) = self.slots.lock().get_mut(index).and_then(Option::as_mut) {
            slot.dirty = true;
        }
    }

    /// 为 fork 创建写时复制子对象
    ///
    /// 子对象共享（retain）每个已填充的帧，父子两侧的槽都标记为写时复制。
    /// 返回的子对象区域计数为 1。
    pub fn fork_for_cow(&self) -> ObjectRef {
        let mut slots = self.slots.lock();
        let child = slots
            .iter_mut()
            .map(|slot| {
                slot.as_mut().map(|s| {
                    s.cow = true;
                    Slot {
                        frame: s.frame.clone(),
                        cow: true,
                        dirty: false,
                    }
                })
            })
            .collect();
        drop(slots);
        Self::create(&self.frames, self.kind.clone(), child)
    }

    /// 丢弃 `pages` 范围内的槽，返回被移出的帧
    ///
    /// 调用者负责在 TLB 失效后再释放返回的帧。
    pub fn decommit(&self, pages: Range<usize>) -> Vec<FrameTracker> {
        let mut slots = self.slots.lock();
        let end = pages.end.min(slots.len());
        let start = pages.start.min(end);
        slots[start..end]
            .iter_mut()
            .filter_map(|slot| slot.take().map(|s| s.frame))
            .collect()
    }

    /// 写回共享文件对象的脏页
    ///
    /// 单页写回失败时重试，仍失败则记录错误并继续其余页面，最终返回 `IoFailure`。
    pub fn sync(&self) -> MmResult<()> {
        let ObjectKind::FileBacked {
            inode,
            offset,
            shared: true,
        } = &self.kind
        else {
            return Ok(());
        };

        let dirty: Vec<(usize, FrameTracker)> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|s| s.dirty)
                    .map(|s| (i, s.frame.clone()))
            })
            .collect();

        let mut result = Ok(());
        for (index, frame) in dirty {
            if let Err(err) = write_page(inode.as_ref(), offset + index * page_size(), &frame) {
                result = Err(err);
            }
        }
        result
    }

    pub(super) fn retain(&self) {
        let prev = self.regions.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain of dead backing object");
    }

    fn try_retain(&self) -> bool {
        let mut cur = self.regions.load(Ordering::Acquire);
        while cur > 0 {
            match self
                .regions
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    fn release(&self) {
        let prev = self.regions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "negative backing object region count");
        if prev == 1 {
            self.teardown();
        }
    }

    fn teardown(&self) {
        if let Err(err) = self.sync() {
            log::error!(
                "backing object {:?}: discarding dirty pages after writeback failure: {}",
                self.kind,
                err
            );
        }
        let slots = core::mem::take(&mut *self.slots.lock());
        log::trace!(
            "backing object {:?}: released {} pages",
            self.kind,
            slots.iter().filter(|s| s.is_some()).count()
        );
        drop(slots);
    }
}

fn write_page(inode: &dyn MmInode, file_offset: usize, frame: &FrameTracker) -> MmResult<()> {
    let len = page_size().min(inode.size().saturating_sub(file_offset));
    if len == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; len];
    frame.read_bytes(0, &mut buf);

    for attempt in 1..=WRITEBACK_ATTEMPTS {
        match inode.write_at(file_offset, &buf) {
            Ok(n) if n == len => return Ok(()),
            Ok(n) => log::error!(
                "Partial write at offset {:#x}: expected {}, got {} (attempt {})",
                file_offset,
                len,
                n,
                attempt
            ),
            Err(errno) => log::error!(
                "writeback of inode {} at {:#x} failed: errno {} (attempt {})",
                inode.identity(),
                file_offset,
                errno,
                attempt
            ),
        }
    }
    Err(MmError::IoFailure)
}

fn page_size() -> usize {
    crate::mm_config().page_size()
}

/// 区域对后备对象的计数引用
///
/// 克隆时区域计数加一，drop 时减一；计数归零时对象被拆除。
pub struct ObjectRef(Arc<BackingObject>);

impl ObjectRef {
    /// 若对象仍存活，取得一个新的计数引用
    pub fn try_share(object: &Arc<BackingObject>) -> Option<Self> {
        object.try_retain().then(|| Self(object.clone()))
    }

    /// 是否指向同一对象
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// 对象地址，用作去重键
    pub fn as_ptr(&self) -> *const BackingObject {
        Arc::as_ptr(&self.0)
    }

    /// 不计数的弱引用
    pub fn downgrade(&self) -> Weak<BackingObject> {
        Arc::downgrade(&self.0)
    }
}

impl Deref for ObjectRef {
    type Target = BackingObject;

    fn deref(&self) -> &BackingObject {
        &self.0
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.0.retain();
        Self(self.0.clone())
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("kind", &self.0.kind)
            .field("regions", &self.region_count())
            .finish()
    }
}
