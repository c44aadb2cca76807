//! Integration tests for private and shared file mappings, msync and
//! writeback failure handling.

mod common;

use std::sync::atomic::Ordering;

use common::{manager, read_u32, write_u32, File, PAGE};
use mm::{AccessKind, FaultOutcome, MmError};
use test_support::mock::fs::MockInode;
use uapi::mm::{MapFlags, MsyncFlags, ProtFlags};

const RW: ProtFlags = ProtFlags::READ.union(ProtFlags::WRITE);

#[test]
fn test_private_file_mapping_reads_file_and_never_writes_back() {
    let mm = manager(32);
    let asid = mm.create_address_space().unwrap();
    let inode = MockInode::with_pattern(4, PAGE, 0x5c);
    let file = File::open(&inode, true, false);

    let addr = mm
        .mmap(asid, 0, 2 * PAGE, RW, MapFlags::PRIVATE, Some(&file), 2 * PAGE)
        .unwrap();
    assert_eq!(
        mm.handle_page_fault(asid, addr, AccessKind::Read),
        Ok(FaultOutcome::PageIn)
    );
    let mut head = [0u8; 2];
    mm.copy_from_user(asid, addr + PAGE, &mut head).unwrap();
    // 每页首字节是文件内页号
    assert_eq!(head, [3, 0x5c]);

    write_u32(&mm, asid, addr, 0xfeedface);
    mm.msync(asid, addr, 2 * PAGE, MsyncFlags::SYNC).unwrap();
    mm.munmap(asid, addr, 2 * PAGE).unwrap();
    assert_eq!(inode.writes.load(Ordering::Relaxed), 0);
    assert_eq!(inode.snapshot()[2 * PAGE], 2);
}

#[test]
fn test_short_file_tail_is_zero_filled() {
    let mm = manager(16);
    let asid = mm.create_address_space().unwrap();
    let inode = MockInode::new(vec![0x7f; 100]);
    let file = File::open(&inode, true, true);

    let addr = mm
        .mmap(asid, 0, 2 * PAGE, ProtFlags::READ, MapFlags::PRIVATE, Some(&file), 0)
        .unwrap();
    let mut page = vec![0xffu8; PAGE];
    mm.copy_from_user(asid, addr, &mut page).unwrap();
    assert!(page[..100].iter().all(|&b| b == 0x7f));
    assert!(page[100..].iter().all(|&b| b == 0));
    // 完全越过文件尾的页为零页
    mm.copy_from_user(asid, addr + PAGE, &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 0));
}

#[test]
fn test_shared_mapping_writes_back_on_msync() {
    let mm = manager(32);
    let asid = mm.create_address_space().unwrap();
    let inode = MockInode::with_pattern(3, PAGE, 0);
    let file = File::open(&inode, true, true);

    let addr = mm
        .mmap(asid, 0, 3 * PAGE, RW, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    assert_eq!(read_u32(&mm, asid, addr + PAGE), 1);
    // 只读过的页不算脏页
    mm.msync(asid, addr, 3 * PAGE, MsyncFlags::SYNC).unwrap();
    assert_eq!(inode.writes.load(Ordering::Relaxed), 0);

    write_u32(&mm, asid, addr + PAGE + 8, 0xa1b2c3d4);
    mm.msync(asid, addr, 3 * PAGE, MsyncFlags::ASYNC).unwrap();
    assert_eq!(inode.writes.load(Ordering::Relaxed), 1);
    let data = inode.snapshot();
    assert_eq!(&data[PAGE + 8..PAGE + 12], &0xa1b2c3d4u32.to_le_bytes());

    // 部分未映射
    assert_eq!(
        mm.msync(asid, addr, 4 * PAGE, MsyncFlags::SYNC),
        Err(MmError::InvalidRange)
    );
}

#[test]
fn test_shared_mapping_visible_across_processes() {
    let mm = manager(64);
    let a = mm.create_address_space().unwrap();
    let b = mm.create_address_space().unwrap();
    let inode = MockInode::with_pattern(2, PAGE, 0);
    let file = File::open(&inode, true, true);

    let addr_a = mm
        .mmap(a, 0, 2 * PAGE, RW, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    let addr_b = mm
        .mmap(b, 0, PAGE, RW, MapFlags::SHARED, Some(&file), PAGE)
        .unwrap();

    write_u32(&mm, b, addr_b + 4, 0x0b0b0b0b);
    assert_eq!(read_u32(&mm, a, addr_a + PAGE + 4), 0x0b0b0b0b);

    // fork 后子进程仍看到同一份共享页
    let child = mm.fork_address_space(a).unwrap();
    write_u32(&mm, child, addr_a + 4, 0x0c0c0c0c);
    mm.destroy_address_space(child).unwrap();
    assert_eq!(read_u32(&mm, a, addr_a + 4), 0x0c0c0c0c);

    mm.destroy_address_space(a).unwrap();
    mm.destroy_address_space(b).unwrap();
    let data = inode.snapshot();
    assert_eq!(&data[4..8], &0x0c0c0c0cu32.to_le_bytes());
    assert_eq!(&data[PAGE + 4..PAGE + 8], &0x0b0b0b0bu32.to_le_bytes());
    assert_eq!(mm.frames().allocated_frames(), 0);
}

#[test]
fn test_writeback_retries_transient_failures() {
    let mm = manager(16);
    let asid = mm.create_address_space().unwrap();
    let inode = MockInode::with_pattern(1, PAGE, 0);
    let file = File::open(&inode, true, true);
    let addr = mm
        .mmap(asid, 0, PAGE, RW, MapFlags::SHARED, Some(&file), 0)
        .unwrap();
    write_u32(&mm, asid, addr, 0x12345678);

    inode.failing_writes.store(2, Ordering::Relaxed);
    mm.msync(asid, addr, PAGE, MsyncFlags::SYNC).unwrap();
    assert_eq!(&inode.snapshot()[..4], &0x12345678u32.to_le_bytes());

    inode.failing_writes.store(usize::MAX, Ordering::Relaxed);
    assert_eq!(
        mm.msync(asid, addr, PAGE, MsyncFlags::SYNC),
        Err(MmError::IoFailure)
    );
    // 脏页保留，之后的同步仍会写回
    inode.failing_writes.store(0, Ordering::Relaxed);
    write_u32(&mm, asid, addr, 0x87654321);
    mm.msync(asid, addr, PAGE, MsyncFlags::SYNC).unwrap();
    assert_eq!(&inode.snapshot()[..4], &0x87654321u32.to_le_bytes());
}

#[test]
fn test_page_in_failure_reaches_caller() {
    let mm = manager(16);
    let asid = mm.create_address_space().unwrap();
    let inode = MockInode::with_pattern(1, PAGE, 0);
    inode.fail_reads.store(true, Ordering::Relaxed);
    let file = File::open(&inode, true, false);
    let addr = mm
        .mmap(asid, 0, PAGE, ProtFlags::READ, MapFlags::PRIVATE, Some(&file), 0)
        .unwrap();
    assert_eq!(
        mm.handle_page_fault(asid, addr, AccessKind::Read),
        Err(MmError::IoFailure)
    );

    inode.fail_reads.store(false, Ordering::Relaxed);
    assert_eq!(
        mm.handle_page_fault(asid, addr, AccessKind::Read),
        Ok(FaultOutcome::PageIn)
    );
}
