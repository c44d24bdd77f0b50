use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;
use slotmap::SlotMap;

use crate::foundation::capabilities::GpuFeatures;
use crate::foundation::clock::{Clock, MonotonicClock};
use crate::foundation::device::{GpuDevice, RawBuffer, RawTexture};
use crate::resources::handles::{BufferHandle, RegionKey, ResourceKey, TextureHandle};
use crate::resources::heap_buckets::BucketTable;
use crate::resources::heap_region::{HeapRegion, RegionBacking, RegionInfo, RegionKind};
use crate::resources::resource_desc::{HeapUsage, ResourceOptions, StorageMode, TextureDesc};
use crate::settings::HeapSettings;
use crate::utilities::{align_up, lock};

/// 资源在 region 中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Placement {
    region: RegionKey,
    offset: u64,
    reserved: u64,
}

struct BufferEntry {
    raw: RawBuffer,
    /// 绑定时使用的 offset，只有软件模拟的 region 不为 0
    bind_offset: u64,
    size: u64,
    placement: Option<Placement>,
    /// raw 是否是该资源独有的设备对象
    owns_raw: bool,
    aliased: bool,
}

struct TextureEntry {
    raw: RawTexture,
    desc: TextureDesc,
    placement: Option<Placement>,
    aliased: bool,
    created_at: Duration,
}

/// 绑定一个 buffer 需要的底层信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: RawBuffer,
    pub offset: u64,
    pub size: u64,
}

/// 碎片整理中被搬走的 texture
///
/// 调用方需要编码 old -> new 的拷贝，并在 GPU 完成后把 old 归还给设备
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub handle: TextureHandle,
    /// old 仍然放置在该 region 中，拷贝完成前 region 不能释放
    pub source: RegionKey,
    pub old: RawTexture,
    pub new: RawTexture,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactResult {
    pub relocations: Vec<Relocation>,
    pub released_regions: usize,
    pub purged_resources: usize,
    pub defrag_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub region_count: usize,
    pub reserved_bytes: u64,
    pub used_bytes: u64,
    pub direct_allocations: usize,
    pub live_buffers: usize,
    pub live_textures: usize,
    pub defrag_bytes_last_frame: u64,
}

#[derive(Default)]
struct HeapAllocatorInner {
    regions: SlotMap<RegionKey, HeapRegion>,
    buffers: SlotMap<BufferHandle, BufferEntry>,
    textures: SlotMap<TextureHandle, TextureEntry>,

    frame: u64,
    static_reserved: u64,
    direct_allocations: usize,
    defrag_bytes_last_frame: u64,

    warned_no_heaps: bool,
    warned_no_memoryless: bool,
}

/// 按尺寸分桶的 buffer / texture 子分配器
///
/// 请求先按 (storage mode, cache mode)、用途和 bucket 找到已有 region 做子分配，
/// 找不到时按 block 表新建 region。释放只把资源标记为 aliased 并归还区间，
/// 设备内存只在 [`HeapAllocator::compact`] 中归还。所有状态由一把锁保护。
pub struct HeapAllocator {
    device: Arc<dyn GpuDevice>,
    settings: HeapSettings,
    buckets: BucketTable,
    clock: Arc<dyn Clock>,
    inner: Mutex<HeapAllocatorInner>,
}

// new & init
impl HeapAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, settings: HeapSettings) -> Self {
        Self::with_clock(device, settings, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(device: Arc<dyn GpuDevice>, settings: HeapSettings, clock: Arc<dyn Clock>) -> Self {
        let buckets = BucketTable::for_platform(device.capabilities().platform);
        Self {
            device,
            settings,
            buckets,
            clock,
            inner: Mutex::new(HeapAllocatorInner::default()),
        }
    }
}

// getters
impl HeapAllocator {
    #[inline]
    pub fn buckets(&self) -> &BucketTable {
        &self.buckets
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    fn supports(&self, feature: GpuFeatures) -> bool {
        self.device.capabilities().supports(feature)
    }

    pub fn stats(&self) -> HeapStats {
        let inner = lock(&self.inner);
        HeapStats {
            region_count: inner.regions.len(),
            reserved_bytes: inner.regions.values().map(HeapRegion::size).sum(),
            used_bytes: inner.regions.values().map(HeapRegion::used).sum(),
            direct_allocations: inner.direct_allocations,
            live_buffers: inner.buffers.values().filter(|e| !e.aliased).count(),
            live_textures: inner.textures.values().filter(|e| !e.aliased).count(),
            defrag_bytes_last_frame: inner.defrag_bytes_last_frame,
        }
    }

    pub fn buffer_binding(&self, handle: BufferHandle) -> BufferBinding {
        let inner = lock(&self.inner);
        match inner.buffers.get(handle) {
            Some(entry) if !entry.aliased => BufferBinding {
                buffer: entry.raw,
                offset: entry.bind_offset,
                size: entry.size,
            },
            _ => panic!("binding of released buffer {handle:?}"),
        }
    }

    pub fn texture_binding(&self, handle: TextureHandle) -> RawTexture {
        let inner = lock(&self.inner);
        match inner.textures.get(handle) {
            Some(entry) if !entry.aliased => entry.raw,
            _ => panic!("binding of released texture {handle:?}"),
        }
    }

    pub fn buffer_region(&self, handle: BufferHandle) -> Option<RegionInfo> {
        let inner = lock(&self.inner);
        let placement = inner.buffers.get(handle)?.placement?;
        Some(self.region_info(&inner.regions[placement.region]))
    }

    pub fn texture_region(&self, handle: TextureHandle) -> Option<RegionInfo> {
        let inner = lock(&self.inner);
        let placement = inner.textures.get(handle)?.placement?;
        Some(self.region_info(&inner.regions[placement.region]))
    }

    fn region_info(&self, region: &HeapRegion) -> RegionInfo {
        RegionInfo {
            size: region.size(),
            used: region.used(),
            bucket: region.bucket,
            exact: self.buckets.is_exact(region.bucket),
            emulated: region.is_emulated(),
            kind: region.kind,
            resource_count: region.resources.len(),
        }
    }
}

// buffer
impl HeapAllocator {
    pub fn create_buffer(&self, size: u64, options: ResourceOptions) -> BufferHandle {
        let _span = tracy_client::span!("HeapAllocator::create_buffer");
        let alignment = self.settings.buffer_alignment;
        let reserved = align_up(size.max(1), alignment);
        let bucket = self.buckets.bucket_index(reserved);

        let mut inner = lock(&self.inner);
        let frame = inner.frame;
        let handle = inner.buffers.insert(BufferEntry {
            raw: RawBuffer(0),
            bind_offset: 0,
            size,
            placement: None,
            owns_raw: true,
            aliased: false,
        });
        let key = ResourceKey::Buffer(handle);

        let placement = match self.find_region(&mut inner, options, RegionKind::Buffer, bucket, reserved, alignment, key)
        {
            Some(placement) => Some(placement),
            None => self
                .create_region(&mut inner, options, RegionKind::Buffer, bucket, reserved, alignment)
                .map(|region| {
                    let offset = self.allocate_in(&mut inner, region, reserved, alignment, key, frame);
                    Placement {
                        region,
                        offset,
                        reserved,
                    }
                }),
        };

        let (raw, bind_offset, owns_raw) = match placement {
            Some(placement) => match inner.regions[placement.region].backing {
                RegionBacking::Heap(heap) => {
                    let raw = self.device.new_placed_buffer(heap, placement.offset, reserved, options);
                    (fatal_if_none(raw, "placed buffer", reserved), 0, true)
                }
                RegionBacking::Buffer(raw) => (raw, placement.offset, false),
            },
            None => {
                inner.direct_allocations += 1;
                (fatal_if_none(self.device.new_buffer(size, options), "buffer", size), 0, true)
            }
        };

        let entry = &mut inner.buffers[handle];
        entry.raw = raw;
        entry.bind_offset = bind_offset;
        entry.owns_raw = owns_raw;
        entry.placement = placement;
        handle
    }

    /// 标记为 aliased 并把区间还给 region，设备对象在下一次 compact 中释放
    pub fn release_buffer(&self, handle: BufferHandle) {
        let mut inner = lock(&self.inner);
        let inner = &mut *inner;
        let Some(entry) = inner.buffers.get_mut(handle) else {
            panic!("release of unknown buffer {handle:?}");
        };
        assert!(!entry.aliased, "buffer {handle:?} released twice");
        entry.aliased = true;
        if let Some(placement) = entry.placement {
            inner.regions[placement.region].release(placement.offset, placement.reserved, ResourceKey::Buffer(handle));
        }
    }
}

// texture
impl HeapAllocator {
    pub fn create_texture(&self, desc: &TextureDesc) -> TextureHandle {
        let _span = tracy_client::span!("HeapAllocator::create_texture");
        let now = self.clock.now();
        let mut desc = desc.clone();

        let mut inner = lock(&self.inner);
        let frame = inner.frame;

        if desc.options.storage_mode == StorageMode::Memoryless {
            if self.supports(GpuFeatures::MEMORYLESS_TEXTURES) {
                return self.create_direct_texture(&mut inner, desc, now);
            }
            if !inner.warned_no_memoryless {
                log::warn!("memoryless textures are not supported, falling back to private storage");
                inner.warned_no_memoryless = true;
            }
            desc.options.storage_mode = StorageMode::Private;
        }

        if !self.supports(GpuFeatures::HEAPS) {
            if !inner.warned_no_heaps {
                log::warn!("device has no heap support, textures are allocated directly");
                inner.warned_no_heaps = true;
            }
            return self.create_direct_texture(&mut inner, desc, now);
        }

        let size_and_align = self.device.texture_size_and_align(&desc);
        let (size, alignment) = (size_and_align.size, size_and_align.align);
        let usage = desc.heap_usage();
        let handle = inner.textures.insert(TextureEntry {
            raw: RawTexture(0),
            desc: desc.clone(),
            placement: None,
            aliased: false,
            created_at: now,
        });
        let key = ResourceKey::Texture(handle);

        let mut placement = None;
        if usage == HeapUsage::RenderTarget {
            placement = self.allocate_static(&mut inner, desc.options, size, alignment, key);
        }
        let bucket = self.buckets.bucket_index(size);
        let kind = RegionKind::Texture(usage);
        if placement.is_none() {
            placement = self.find_region(&mut inner, desc.options, kind, bucket, size, alignment, key);
        }
        if placement.is_none()
            && let Some(region) = self.create_region(&mut inner, desc.options, kind, bucket, size, alignment)
        {
            let offset = self.allocate_in(&mut inner, region, size, alignment, key, frame);
            placement = Some(Placement {
                region,
                offset,
                reserved: size,
            });
        }

        let Some(placement) = placement else {
            inner.textures.remove(handle);
            return self.create_direct_texture(&mut inner, desc, now);
        };

        let RegionBacking::Heap(heap) = inner.regions[placement.region].backing else {
            panic!("texture placed into an emulated buffer region");
        };
        let raw = fatal_if_none(self.device.new_placed_texture(heap, placement.offset, &desc), "placed texture", size);
        let entry = &mut inner.textures[handle];
        entry.raw = raw;
        entry.placement = Some(placement);
        handle
    }

    fn create_direct_texture(&self, inner: &mut HeapAllocatorInner, desc: TextureDesc, now: Duration) -> TextureHandle {
        let raw = fatal_if_none(self.device.new_texture(&desc), "texture", desc.unaligned_size());
        inner.direct_allocations += 1;
        inner.textures.insert(TextureEntry {
            raw,
            desc,
            placement: None,
            aliased: false,
            created_at: now,
        })
    }

    pub fn release_texture(&self, handle: TextureHandle) {
        let mut inner = lock(&self.inner);
        let inner = &mut *inner;
        let Some(entry) = inner.textures.get_mut(handle) else {
            panic!("release of unknown texture {handle:?}");
        };
        assert!(!entry.aliased, "texture {handle:?} released twice");
        entry.aliased = true;
        if let Some(placement) = entry.placement {
            inner.regions[placement.region].release(placement.offset, placement.reserved, ResourceKey::Texture(handle));
        }
    }

    /// 先尝试已有的静态 render target heap，预算还有剩余时创建新的
    fn allocate_static(
        &self,
        inner: &mut HeapAllocatorInner,
        options: ResourceOptions,
        size: u64,
        alignment: u64,
        key: ResourceKey,
    ) -> Option<Placement> {
        let budget = (self.device.capabilities().texture_memory_budget as f64
            * self.settings.static_render_target_fraction as f64) as u64;
        if budget == 0 {
            return None;
        }
        let frame = inner.frame;

        let existing = inner
            .regions
            .iter()
            .filter(|(_, r)| r.kind == RegionKind::StaticRenderTarget && r.options == options)
            .map(|(k, _)| k)
            .collect_vec();
        for region in existing {
            if let Some(offset) = inner.regions[region].allocate(size, alignment, key, frame) {
                return Some(Placement {
                    region,
                    offset,
                    reserved: size,
                });
            }
        }

        let remaining = budget.saturating_sub(inner.static_reserved);
        if remaining < size {
            return None;
        }
        let heap = self.device.new_heap(remaining, options)?;
        log::info!("static render target heap created: {} MiB, {options:?}", remaining >> 20);
        inner.static_reserved += remaining;
        let region = inner.regions.insert(HeapRegion::new(
            RegionBacking::Heap(heap),
            options,
            RegionKind::StaticRenderTarget,
            self.buckets.exact_bucket(),
            remaining,
            self.clock.now(),
            frame,
        ));
        let offset = self.allocate_in(inner, region, size, alignment, key, frame);
        Some(Placement {
            region,
            offset,
            reserved: size,
        })
    }
}

// region 查找与创建
impl HeapAllocator {
    /// 在 bucket 以及 look-ahead 范围内的已有 region 中查找，exact-size region 不参与复用
    #[allow(clippy::too_many_arguments)]
    fn find_region(
        &self,
        inner: &mut HeapAllocatorInner,
        options: ResourceOptions,
        kind: RegionKind,
        bucket: usize,
        size: u64,
        alignment: u64,
        key: ResourceKey,
    ) -> Option<Placement> {
        if self.buckets.is_exact(bucket) {
            return None;
        }
        let look_ahead = match self.buckets.bucket_size(bucket) {
            Some(bucket_size) if bucket_size < self.settings.look_ahead_ceiling => self.settings.look_ahead,
            _ => 0,
        };
        let last = (bucket + look_ahead).min(self.buckets.len() - 1);
        let frame = inner.frame;

        for candidate in bucket..=last {
            let regions = inner
                .regions
                .iter()
                .filter(|(_, r)| r.matches(options, kind, candidate))
                .map(|(k, _)| k)
                .collect_vec();
            for region in regions {
                if let Some(offset) = inner.regions[region].allocate(size, alignment, key, frame) {
                    return Some(Placement {
                        region,
                        offset,
                        reserved: size,
                    });
                }
            }
        }
        None
    }

    /// 创建新 region；设备不支持或创建 heap 失败时返回 None，由调用方直接分配
    fn create_region(
        &self,
        inner: &mut HeapAllocatorInner,
        options: ResourceOptions,
        kind: RegionKind,
        bucket: usize,
        size: u64,
        alignment: u64,
    ) -> Option<RegionKey> {
        let block = align_up(self.buckets.block_size(bucket, size), alignment);
        let backing = if self.supports(GpuFeatures::HEAPS) {
            match self.device.new_heap(block, options) {
                Some(heap) => RegionBacking::Heap(heap),
                None => {
                    log::warn!("heap creation of {block} bytes failed, falling back to a direct allocation");
                    return None;
                }
            }
        } else {
            // 只有 buffer 会走到这里
            RegionBacking::Buffer(fatal_if_none(self.device.new_buffer(block, options), "emulated heap", block))
        };

        log::debug!(
            "heap region created: {kind:?} bucket {bucket}{} {block} bytes {options:?}",
            if self.buckets.is_exact(bucket) { " (exact)" } else { "" }
        );
        let frame = inner.frame;
        Some(inner.regions.insert(HeapRegion::new(backing, options, kind, bucket, block, self.clock.now(), frame)))
    }

    fn allocate_in(
        &self,
        inner: &mut HeapAllocatorInner,
        region: RegionKey,
        size: u64,
        alignment: u64,
        key: ResourceKey,
        frame: u64,
    ) -> u64 {
        match inner.regions[region].allocate(size, alignment, key, frame) {
            Some(offset) => offset,
            None => panic!("fresh region cannot hold {size} bytes"),
        }
    }
}

fn fatal_if_none<T>(value: Option<T>, what: &str, size: u64) -> T {
    match value {
        Some(value) => value,
        None => {
            log::error!("device out of memory: {what} of {size} bytes");
            panic!("device memory exhausted allocating {what} of {size} bytes");
        }
    }
}

// compact
impl HeapAllocator {
    /// 每帧调用一次：有 heap 支持时先碎片整理，再释放空的 region 和 aliased 的资源
    pub fn compact(&self, frame: u64, force: bool) -> CompactResult {
        let _span = tracy_client::span!("HeapAllocator::compact");
        let mut inner = lock(&self.inner);
        inner.frame = frame;

        let mut result = CompactResult::default();
        if self.supports(GpuFeatures::HEAPS) {
            self.defrag(&mut inner, force, &mut result);
        }
        self.drain(&mut inner, force, &mut result);

        inner.defrag_bytes_last_frame = result.defrag_bytes;
        result
    }

    /// 只释放空 region 和 aliased 的资源，不搬运任何资源，用于关闭前 GPU 已经空闲时
    pub fn drain_unused(&self, frame: u64) -> CompactResult {
        let _span = tracy_client::span!("HeapAllocator::drain_unused");
        let mut inner = lock(&self.inner);
        inner.frame = frame;

        let mut result = CompactResult::default();
        self.drain(&mut inner, true, &mut result);
        inner.defrag_bytes_last_frame = 0;
        result
    }

    /// storage mode -> usage -> bucket（从大到小）的顺序扫描动态 texture region，
    /// 预算用完时直接返回，剩下的留给下一帧
    fn defrag(&self, inner: &mut HeapAllocatorInner, force: bool, result: &mut CompactResult) {
        let _span = tracy_client::span!("HeapAllocator::defrag");
        let now = self.clock.now();
        let frame = inner.frame;
        let min_age = Duration::from_millis(self.settings.defrag_min_age_ms);

        for storage_mode in [StorageMode::Shared, StorageMode::Managed, StorageMode::Private] {
            for usage in [HeapUsage::Resource, HeapUsage::RenderTarget] {
                for bucket in (0..self.buckets.len()).rev() {
                    let kind = RegionKind::Texture(usage);
                    let candidates = inner
                        .regions
                        .iter()
                        .filter(|(_, r)| {
                            r.kind == kind && r.bucket == bucket && r.options.storage_mode == storage_mode && !r.is_empty()
                        })
                        .map(|(k, _)| k)
                        .collect_vec();

                    for source in candidates {
                        if !self.should_defrag(inner, source, frame, now, min_age) {
                            continue;
                        }
                        if !self.evacuate(inner, source, force, now, result) {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn should_defrag(
        &self,
        inner: &HeapAllocatorInner,
        source: RegionKey,
        frame: u64,
        now: Duration,
        min_age: Duration,
    ) -> bool {
        let region = &inner.regions[source];
        let sparse = region.free_fraction() > self.settings.defrag_free_fraction;
        let idle = frame.saturating_sub(region.last_used_frame) > self.settings.defrag_idle_frames;
        if !sparse && !idle {
            return false;
        }
        // 只要有一个“热”资源就不动整个 region
        region.resources.iter().all(|resource| match resource {
            ResourceKey::Texture(handle) => {
                inner.textures.get(*handle).is_some_and(|e| now.saturating_sub(e.created_at) >= min_age)
            }
            ResourceKey::Buffer(_) => false,
        })
    }

    /// 把 source 中的 texture 搬到同类中更满的 region，预算耗尽时返回 false
    fn evacuate(
        &self,
        inner: &mut HeapAllocatorInner,
        source: RegionKey,
        force: bool,
        now: Duration,
        result: &mut CompactResult,
    ) -> bool {
        let frame = inner.frame;
        let resources = inner.regions[source].resources.iter().copied().collect_vec();

        for resource in resources {
            let ResourceKey::Texture(handle) = resource else {
                continue;
            };
            let Some(Placement { offset, reserved, .. }) = inner.textures[handle].placement else {
                continue;
            };
            if !force && result.defrag_bytes + reserved > self.settings.defrag_bytes_per_frame {
                return false;
            }

            let (options, kind, bucket, source_used) = {
                let r = &inner.regions[source];
                (r.options, r.kind, r.bucket, r.used())
            };
            let alignment = self.device.texture_size_and_align(&inner.textures[handle].desc).align;
            let targets = inner
                .regions
                .iter()
                .filter(|(k, r)| *k != source && r.matches(options, kind, bucket) && r.used() > source_used)
                .map(|(k, _)| k)
                .collect_vec();

            let Some((target, new_offset)) = targets
                .into_iter()
                .find_map(|target| inner.regions[target].allocate(reserved, alignment, resource, frame).map(|o| (target, o)))
            else {
                continue;
            };

            let RegionBacking::Heap(heap) = inner.regions[target].backing else {
                panic!("texture region without a device heap");
            };
            let Some(new_raw) = self.device.new_placed_texture(heap, new_offset, &inner.textures[handle].desc) else {
                log::error!("defrag: placing texture into region {target:?} failed");
                inner.regions[target].release(new_offset, reserved, resource);
                continue;
            };

            inner.regions[source].release(offset, reserved, resource);
            inner.regions[source].last_used_frame = frame;
            let entry = &mut inner.textures[handle];
            let old_raw = std::mem::replace(&mut entry.raw, new_raw);
            entry.placement = Some(Placement {
                region: target,
                offset: new_offset,
                reserved,
            });
            entry.created_at = now;

            log::debug!("defrag: texture {handle:?} moved {source:?} -> {target:?} ({reserved} bytes)");
            result.defrag_bytes += reserved;
            result.relocations.push(Relocation {
                handle,
                source,
                old: old_raw,
                new: new_raw,
                size: reserved,
            });
        }
        true
    }

    fn drain(&self, inner: &mut HeapAllocatorInner, force: bool, result: &mut CompactResult) {
        let _span = tracy_client::span!("HeapAllocator::drain");

        let aliased_buffers = inner.buffers.iter().filter(|(_, e)| e.aliased).map(|(h, _)| h).collect_vec();
        for handle in aliased_buffers {
            if let Some(entry) = inner.buffers.remove(handle) {
                if entry.owns_raw {
                    self.device.release_buffer(entry.raw);
                }
                if entry.placement.is_none() {
                    inner.direct_allocations -= 1;
                }
                result.purged_resources += 1;
            }
        }
        let aliased_textures = inner.textures.iter().filter(|(_, e)| e.aliased).map(|(h, _)| h).collect_vec();
        for handle in aliased_textures {
            if let Some(entry) = inner.textures.remove(handle) {
                self.device.release_texture(entry.raw);
                if entry.placement.is_none() {
                    inner.direct_allocations -= 1;
                }
                result.purged_resources += 1;
            }
        }

        let frame = inner.frame;
        let releasable = inner
            .regions
            .iter()
            .filter(|(_, r)| r.is_empty())
            // 本次搬走的 region 里还有等待拷贝的旧 texture
            .filter(|(k, _)| !result.relocations.iter().any(|relocation| relocation.source == *k))
            .filter(|(_, r)| {
                let age = frame.saturating_sub(r.last_used_frame);
                force
                    || match r.kind {
                        RegionKind::StaticRenderTarget => false,
                        _ if self.buckets.is_exact(r.bucket) => true,
                        _ if r.is_emulated() => age > self.settings.emulated_cull_frames,
                        _ => age > self.settings.cull_frames,
                    }
            })
            .map(|(k, _)| k)
            .collect_vec();

        for key in releasable {
            let Some(region) = inner.regions.remove(key) else {
                continue;
            };
            log::debug!("heap region released: {:?} bucket {} {} bytes", region.kind, region.bucket, region.size());
            if region.kind == RegionKind::StaticRenderTarget {
                inner.static_reserved -= region.size();
            }
            match region.backing {
                RegionBacking::Heap(heap) => self.device.release_heap(heap),
                RegionBacking::Buffer(buffer) => self.device.release_buffer(buffer),
            }
            result.released_regions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::capabilities::{GpuCapabilities, PlatformClass};
    use crate::foundation::clock::ManualClock;
    use crate::foundation::headless_device::HeadlessDevice;
    use crate::resources::resource_desc::TextureUsage;

    struct Fixture {
        headless: Arc<HeadlessDevice>,
        clock: Arc<ManualClock>,
        allocator: HeapAllocator,
    }

    fn fixture(capabilities: GpuCapabilities, settings: HeapSettings) -> Fixture {
        let headless = Arc::new(HeadlessDevice::new(capabilities));
        let clock = Arc::new(ManualClock::default());
        let allocator = HeapAllocator::with_clock(headless.clone(), settings, clock.clone());
        Fixture {
            headless,
            clock,
            allocator,
        }
    }

    fn desktop() -> Fixture {
        fixture(GpuCapabilities::desktop(), HeapSettings::default())
    }

    #[test]
    fn test_scenario_small_buffer_reuse() {
        let f = desktop();
        let a = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        let _b = f.allocator.create_buffer(900, ResourceOptions::PRIVATE);
        let region_a = f.allocator.buffer_region(a).unwrap();
        let before = f.allocator.stats();
        let heaps = f.headless.live_heap_count();
        f.allocator.release_buffer(a);

        let c = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        let after = f.allocator.stats();
        assert_eq!(after.region_count, before.region_count);
        assert_eq!(after.reserved_bytes, before.reserved_bytes);
        assert_eq!(f.headless.live_heap_count(), heaps);
        assert_eq!(f.allocator.buffer_region(c), Some(region_a));
    }

    #[test]
    fn test_aliasing_round_trip_same_bucket() {
        let f = desktop();
        let a = f.allocator.create_buffer(3000, ResourceOptions::SHARED);
        let regions = f.allocator.stats().region_count;
        f.allocator.release_buffer(a);
        let b = f.allocator.create_buffer(4000, ResourceOptions::SHARED);
        assert_eq!(f.allocator.stats().region_count, regions);
        assert_eq!(f.allocator.buffer_binding(b).size, 4000);
    }

    #[test]
    fn test_scenario_exact_size_region() {
        let f = desktop();
        let huge = 300 << 20;
        let a = f.allocator.create_buffer(huge, ResourceOptions::PRIVATE);
        let info = f.allocator.buffer_region(a).unwrap();
        assert!(info.exact);
        assert_eq!(info.size, huge);

        f.allocator.release_buffer(a);
        let b = f.allocator.create_buffer(huge - 4096, ResourceOptions::PRIVATE);
        let info_b = f.allocator.buffer_region(b).unwrap();
        assert!(info_b.exact);
        assert_eq!(info_b.size, huge - 4096);
        assert_eq!(f.allocator.stats().region_count, 2);

        // 空的 exact region 在下一次 compact 时立即释放
        let result = f.allocator.compact(1, false);
        assert_eq!(result.released_regions, 1);
        assert_eq!(f.allocator.stats().region_count, 1);
    }

    #[test]
    fn test_look_ahead_below_ceiling_only() {
        let f = desktop();
        let a = f.allocator.create_buffer(512, ResourceOptions::PRIVATE);
        let b = f.allocator.create_buffer(200, ResourceOptions::PRIVATE);
        // 200 -> 256 bucket 没有 region，向上找到 512 bucket 的 region
        assert_eq!(f.allocator.stats().region_count, 1);
        assert_eq!(f.allocator.buffer_region(a), f.allocator.buffer_region(b));

        let f = desktop();
        let a = f.allocator.create_buffer(4 << 20, ResourceOptions::PRIVATE);
        let b = f.allocator.create_buffer(2 << 20, ResourceOptions::PRIVATE);
        // 2 MiB bucket 超过 ceiling，不向上查找
        assert_ne!(f.allocator.buffer_region(a).unwrap().bucket, f.allocator.buffer_region(b).unwrap().bucket);
        assert_eq!(f.allocator.stats().region_count, 2);
    }

    #[test]
    fn test_storage_modes_do_not_share_regions() {
        let f = desktop();
        f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        f.allocator.create_buffer(100, ResourceOptions::SHARED);
        f.allocator.create_buffer(100, ResourceOptions::SHARED_WRITE_COMBINED);
        assert_eq!(f.allocator.stats().region_count, 3);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let f = desktop();
        let a = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        f.allocator.release_buffer(a);
        f.allocator.release_buffer(a);
    }

    #[test]
    fn test_drain_culls_aged_regions() {
        let f = desktop();
        let a = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        f.allocator.release_buffer(a);

        let result = f.allocator.compact(10, false);
        assert_eq!(result.purged_resources, 1);
        assert_eq!(result.released_regions, 0);
        assert_eq!(f.headless.live_buffer_count(), 0);

        let result = f.allocator.compact(31, false);
        assert_eq!(result.released_regions, 1);
        assert_eq!(f.headless.live_heap_count(), 0);
    }

    #[test]
    fn test_forced_drain_releases_everything_empty() {
        let f = desktop();
        let keep = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        let rt = f.allocator.create_texture(&TextureDesc::new_render_target(256, 256, 4));
        let tex = f.allocator.create_texture(&TextureDesc::new_2d(64, 64, 4));
        f.allocator.release_texture(rt);
        f.allocator.release_texture(tex);

        f.allocator.compact(1, true);
        assert_eq!(f.allocator.stats().region_count, 1);
        assert_eq!(f.allocator.buffer_binding(keep).size, 100);
        assert_eq!(f.headless.live_texture_count(), 0);
    }

    #[test]
    fn test_render_targets_prefer_static_heap() {
        let f = desktop();
        let rt = f.allocator.create_texture(&TextureDesc::new_render_target(1920, 1080, 4));
        let info = f.allocator.texture_region(rt).unwrap();
        assert_eq!(info.kind, RegionKind::StaticRenderTarget);
        assert_eq!(info.size, (2u64 << 30) / 4);

        let plain = f.allocator.create_texture(&TextureDesc::new_2d(512, 512, 4));
        assert_eq!(f.allocator.texture_region(plain).unwrap().kind, RegionKind::Texture(HeapUsage::Resource));

        // 静态 heap 不会因为空闲被回收
        f.allocator.release_texture(rt);
        f.allocator.compact(1000, false);
        assert_eq!(f.allocator.stats().region_count, 2);
    }

    #[test]
    fn test_fallbacks_without_heaps() {
        let f = fixture(GpuCapabilities::minimal(PlatformClass::Desktop), HeapSettings::default());
        let tex = f.allocator.create_texture(&TextureDesc::new_2d(64, 64, 4));
        assert!(f.allocator.texture_region(tex).is_none());
        assert_eq!(f.allocator.stats().direct_allocations, 1);

        // buffer 使用软件模拟的 region，同一个设备 buffer 不同 offset
        let a = f.allocator.create_buffer(100, ResourceOptions::SHARED);
        let b = f.allocator.create_buffer(100, ResourceOptions::SHARED);
        let (ba, bb) = (f.allocator.buffer_binding(a), f.allocator.buffer_binding(b));
        assert_eq!(ba.buffer, bb.buffer);
        assert_ne!(ba.offset, bb.offset);
        assert!(f.allocator.buffer_region(a).unwrap().emulated);

        f.allocator.release_texture(tex);
        f.allocator.compact(1, false);
        assert_eq!(f.allocator.stats().direct_allocations, 0);
        assert_eq!(f.headless.live_texture_count(), 0);
    }

    #[test]
    fn test_heap_creation_failure_falls_back_to_direct() {
        let f = desktop();
        f.headless.set_fail_heap_creation(true);
        let a = f.allocator.create_buffer(100, ResourceOptions::PRIVATE);
        assert!(f.allocator.buffer_region(a).is_none());
        assert_eq!(f.allocator.stats().direct_allocations, 1);
    }

    #[test]
    fn test_memoryless_is_direct() {
        let f = fixture(GpuCapabilities::mobile(), HeapSettings::for_platform(PlatformClass::Mobile));
        let desc = TextureDesc::new_render_target(128, 128, 4).with_options(ResourceOptions::MEMORYLESS);
        let tex = f.allocator.create_texture(&desc);
        assert!(f.allocator.texture_region(tex).is_none());
        assert_eq!(f.allocator.stats().direct_allocations, 1);
    }

    #[test]
    #[should_panic(expected = "device memory exhausted")]
    fn test_true_exhaustion_is_fatal() {
        let f = fixture(GpuCapabilities::minimal(PlatformClass::Desktop), HeapSettings::default());
        f.headless.set_memory_limit(Some(1 << 10));
        f.allocator.create_texture(&TextureDesc::new_2d(1024, 1024, 4));
    }

    fn defrag_settings(budget: u64) -> HeapSettings {
        HeapSettings {
            defrag_bytes_per_frame: budget,
            static_render_target_fraction: 0.0,
            ..HeapSettings::default()
        }
    }

    /// 两个同 bucket 的 region：a 里剩一个资源，b 里剩多个，a 的资源应当被搬到 b
    fn fragmented(f: &Fixture) -> (Vec<TextureHandle>, TextureHandle) {
        // 256x256x4 = 256 KiB，每个 4 MiB 的 region 能放 16 个
        let desc = TextureDesc::new_2d(256, 256, 4).with_usage(TextureUsage::SHADER_READ);
        let textures = (0..32).map(|_| f.allocator.create_texture(&desc)).collect_vec();
        assert_eq!(f.allocator.stats().region_count, 2);
        // 第一个 region 只留 textures[0]，第二个留下 8 个
        for &t in &textures[1..16] {
            f.allocator.release_texture(t);
        }
        for &t in &textures[24..32] {
            f.allocator.release_texture(t);
        }
        (textures[16..24].to_vec(), textures[0])
    }

    #[test]
    fn test_defrag_moves_old_resources_into_fuller_region() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(64 << 20));
        let (dense, lonely) = fragmented(&f);
        let old_raw = f.allocator.texture_binding(lonely);

        f.clock.advance(Duration::from_secs(2));
        let result = f.allocator.compact(1, false);
        assert_eq!(result.relocations.len(), 1);
        assert_eq!(result.relocations[0].handle, lonely);
        assert_eq!(result.relocations[0].old, old_raw);
        assert_ne!(f.allocator.texture_binding(lonely), old_raw);
        assert_eq!(f.allocator.texture_region(lonely), f.allocator.texture_region(dense[0]));
        assert_eq!(f.allocator.stats().defrag_bytes_last_frame, 256 << 10);
    }

    #[test]
    fn test_evacuated_region_outlives_its_relocations() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(64 << 20));
        let (_, lonely) = fragmented(&f);
        assert_eq!(f.headless.live_heap_count(), 2);

        // 超过 idle 帧数触发整理，同时也超过了 cull 帧数
        f.clock.advance(Duration::from_secs(2));
        let result = f.allocator.compact(61, false);
        assert_eq!(result.relocations.len(), 1);
        assert_eq!(result.released_regions, 0);
        assert_eq!(f.headless.live_heap_count(), 2);
        assert_eq!(result.relocations[0].handle, lonely);

        assert_eq!(f.allocator.compact(62, false).released_regions, 0);
        assert_eq!(f.allocator.compact(92, false).released_regions, 1);
        assert_eq!(f.headless.live_heap_count(), 1);
    }

    #[test]
    fn test_forced_defrag_keeps_source_region() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(64 << 20));
        fragmented(&f);
        f.clock.advance(Duration::from_secs(2));
        let result = f.allocator.compact(2, true);
        assert_eq!(result.relocations.len(), 1);
        assert_eq!(result.released_regions, 0);
        assert_eq!(f.headless.live_heap_count(), 2);
    }

    #[test]
    fn test_drain_unused_never_relocates() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(64 << 20));
        let (_, lonely) = fragmented(&f);
        let raw = f.allocator.texture_binding(lonely);
        f.clock.advance(Duration::from_secs(2));

        let result = f.allocator.drain_unused(5);
        assert!(result.relocations.is_empty());
        assert_eq!(result.purged_resources, 23);
        assert_eq!(f.allocator.texture_binding(lonely), raw);
        assert_eq!(f.allocator.stats().region_count, 2);
        assert_eq!(f.allocator.stats().defrag_bytes_last_frame, 0);
    }

    #[test]
    fn test_defrag_never_moves_young_resources() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(64 << 20));
        fragmented(&f);
        f.clock.advance(Duration::from_millis(999));
        let result = f.allocator.compact(1, false);
        assert!(result.relocations.is_empty());
    }

    #[test]
    fn test_defrag_respects_budget_unless_forced() {
        let f = fixture(GpuCapabilities::desktop(), defrag_settings(100 << 10));
        fragmented(&f);
        f.clock.advance(Duration::from_secs(2));
        let result = f.allocator.compact(1, false);
        assert!(result.defrag_bytes <= 100 << 10);
        assert!(result.relocations.is_empty());

        let result = f.allocator.compact(2, true);
        assert_eq!(result.relocations.len(), 1);
    }

    #[test]
    fn test_concurrent_allocation() {
        use rayon::prelude::*;
        let f = desktop();
        let handles: Vec<BufferHandle> =
            (0..64u64).into_par_iter().map(|i| f.allocator.create_buffer(100 + i * 10, ResourceOptions::SHARED)).collect();
        let mut bindings = handles.iter().map(|&h| f.allocator.buffer_binding(h)).collect_vec();
        bindings.sort_by_key(|b| b.buffer);
        assert_eq!(bindings.iter().map(|b| b.buffer).dedup().count(), 64);
        handles.par_iter().for_each(|&h| f.allocator.release_buffer(h));
        f.allocator.compact(100, false);
        assert_eq!(f.allocator.stats().region_count, 0);
    }
}
