//! 区域集合
//!
//! 区域存放在带空闲链表的槽数组中，[`RegionId`] 在区域被移除之前保持稳定；
//! 另以起始页号为键的 `BTreeMap` 维护有序索引，用于按地址查找与区间查询。
//!
//! 区域的范围是索引键的一部分，因此修改范围必须先 [`RegionSet::remove`]
//! 再重新 [`RegionSet::insert`]。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::region::Region;
use crate::address::{Vpn, VpnRange};

/// 区域在集合中的稳定下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(usize);

/// 按起始地址有序、互不重叠的区域集合
#[derive(Default)]
pub struct RegionSet {
    slots: Vec<Option<Region>>,
    free: Vec<usize>,
    by_start: BTreeMap<Vpn, usize>,
}

impl RegionSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 区域个数
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// 插入区域；与已有区域重叠时原样返回
    pub fn insert(&mut self, region: Region) -> Result<RegionId, Region> {
        if self.overlapping(region.range()).next().is_some() {
            return Err(region);
        }
        let start = region.start();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(region);
                idx
            }
            None => {
                self.slots.push(Some(region));
                self.slots.len() - 1
            }
        };
        self.by_start.insert(start, idx);
        Ok(RegionId(idx))
    }

    /// 移除区域
    ///
    /// # Panics
    /// `id` 已失效时 panic
    pub fn remove(&mut self, id: RegionId) -> Region {
        let region = self.slots[id.0]
            .take()
            .unwrap_or_else(|| panic!("stale region id {:?}", id));
        self.by_start.remove(&region.start());
        self.free.push(id.0);
        region
    }

    /// 按下标取区域
    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// 包含页 `vpn` 的区域
    pub fn find(&self, vpn: Vpn) -> Option<RegionId> {
        let (_, &idx) = self.by_start.range(..=vpn).next_back()?;
        self.slots[idx]
            .as_ref()
            .filter(|r| r.range().contains(vpn))
            .map(|_| RegionId(idx))
    }

    /// 与 `range` 相交的区域，按地址升序
    pub fn overlapping(&self, range: VpnRange) -> impl Iterator<Item = RegionId> + '_ {
        // 起点在 range 之前的区域至多一个可能与之相交
        let before = self
            .by_start
            .range(..range.start())
            .next_back()
            .map(|(_, &idx)| idx);
        before
            .into_iter()
            .chain(self.by_start.range(range.start()..range.end()).map(|(_, &idx)| idx))
            .filter(move |&idx| {
                self.slots[idx]
                    .as_ref()
                    .is_some_and(|r| r.range().overlaps(&range))
            })
            .map(RegionId)
    }

    /// 按地址升序遍历区域
    pub fn iter(&self) -> impl Iterator<Item = &Region> + '_ {
        self.by_start
            .values()
            .filter_map(|&idx| self.slots[idx].as_ref())
    }

    /// 移出全部区域
    pub fn drain(&mut self) -> Vec<Region> {
        let out = self
            .by_start
            .values()
            .filter_map(|&idx| self.slots[idx].take())
            .collect();
        self.by_start.clear();
        self.slots.clear();
        self.free.clear();
        out
    }
}
