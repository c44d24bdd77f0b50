use std::collections::BTreeSet;
use std::time::Duration;

use crate::foundation::device::{RawBuffer, RawHeap};
use crate::resources::handles::ResourceKey;
use crate::resources::range_allocator::RangeAllocator;
use crate::resources::resource_desc::{HeapUsage, ResourceOptions};

/// region 背后真正的设备分配
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionBacking {
    /// 设备 heap，资源以 placed 的方式放在其中
    Heap(RawHeap),
    /// 不支持 heap 时用一个大 buffer 模拟，资源按 offset 子分配
    Buffer(RawBuffer),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Buffer,
    Texture(HeapUsage),
    /// 预留的 render target heap，大小由全局 texture 预算决定
    StaticRenderTarget,
}

/// 一块真实的设备分配，内部被切分给多个资源
pub struct HeapRegion {
    pub(crate) backing: RegionBacking,
    pub(crate) options: ResourceOptions,
    pub(crate) kind: RegionKind,
    pub(crate) bucket: usize,
    pub(crate) ranges: RangeAllocator,
    pub(crate) created_at: Duration,
    pub(crate) last_used_frame: u64,
    pub(crate) resources: BTreeSet<ResourceKey>,
}

impl HeapRegion {
    pub fn new(
        backing: RegionBacking,
        options: ResourceOptions,
        kind: RegionKind,
        bucket: usize,
        size: u64,
        created_at: Duration,
        frame: u64,
    ) -> Self {
        Self {
            backing,
            options,
            kind,
            bucket,
            ranges: RangeAllocator::new(size),
            created_at,
            last_used_frame: frame,
            resources: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.ranges.size()
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.ranges.used_bytes()
    }

    #[inline]
    pub fn free_fraction(&self) -> f32 {
        if self.size() == 0 { 0.0 } else { self.ranges.free_bytes() as f32 / self.size() as f32 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[inline]
    pub fn is_emulated(&self) -> bool {
        matches!(self.backing, RegionBacking::Buffer(_))
    }

    /// 属于同一类 region：相同的 (storage mode, cache mode)、用途以及 bucket
    #[inline]
    pub fn matches(&self, options: ResourceOptions, kind: RegionKind, bucket: usize) -> bool {
        self.options == options && self.kind == kind && self.bucket == bucket
    }

    /// 子分配，成功时记录资源并刷新使用帧
    pub fn allocate(&mut self, size: u64, alignment: u64, resource: ResourceKey, frame: u64) -> Option<u64> {
        let offset = self.ranges.allocate(size, alignment)?;
        self.resources.insert(resource);
        self.last_used_frame = frame;
        Some(offset)
    }

    pub fn release(&mut self, offset: u64, size: u64, resource: ResourceKey) {
        assert!(self.resources.remove(&resource), "{resource:?} does not live in this region");
        self.ranges.free(offset, size);
    }
}

/// 对外暴露的 region 信息
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionInfo {
    pub size: u64,
    pub used: u64,
    pub bucket: usize,
    pub exact: bool,
    pub emulated: bool,
    pub kind: RegionKind,
    pub resource_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::handles::BufferHandle;
    use slotmap::SlotMap;

    #[test]
    fn test_region_bookkeeping() {
        let mut keys: SlotMap<BufferHandle, ()> = SlotMap::with_key();
        let a = ResourceKey::Buffer(keys.insert(()));
        let b = ResourceKey::Buffer(keys.insert(()));

        let mut region = HeapRegion::new(
            RegionBacking::Heap(RawHeap(1)),
            ResourceOptions::PRIVATE,
            RegionKind::Buffer,
            0,
            1024,
            Duration::ZERO,
            0,
        );
        let offset_a = region.allocate(256, 256, a, 3).unwrap();
        let offset_b = region.allocate(256, 256, b, 4).unwrap();
        assert_eq!(region.last_used_frame, 4);
        assert_eq!(region.free_fraction(), 0.5);

        region.release(offset_a, 256, a);
        region.release(offset_b, 256, b);
        assert!(region.is_empty());
        assert_eq!(region.used(), 0);
        assert!(!region.is_emulated());
    }
}
