use bitflags::bitflags;
use serde::Deserialize;

/// 资源所在的存储位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum StorageMode {
    /// CPU / GPU 共享
    Shared,
    /// CPU / GPU 各持一份，需要显式同步
    Managed,
    /// 仅 GPU 可见
    Private,
    /// 只存在于 tile memory，不占用显存
    Memoryless,
}

/// CPU 缓存模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum CpuCacheMode {
    DefaultCache,
    WriteCombined,
}

/// 资源的分配选项，(storage mode, cache mode) 决定资源能放进哪一类 heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceOptions {
    pub storage_mode: StorageMode,
    pub cache_mode: CpuCacheMode,
}

impl ResourceOptions {
    pub const SHARED: Self = Self::new(StorageMode::Shared, CpuCacheMode::DefaultCache);
    pub const SHARED_WRITE_COMBINED: Self = Self::new(StorageMode::Shared, CpuCacheMode::WriteCombined);
    pub const MANAGED: Self = Self::new(StorageMode::Managed, CpuCacheMode::DefaultCache);
    pub const PRIVATE: Self = Self::new(StorageMode::Private, CpuCacheMode::DefaultCache);
    pub const MEMORYLESS: Self = Self::new(StorageMode::Memoryless, CpuCacheMode::DefaultCache);

    #[inline]
    pub const fn new(storage_mode: StorageMode, cache_mode: CpuCacheMode) -> Self {
        Self {
            storage_mode,
            cache_mode,
        }
    }
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self::PRIVATE
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
    }
}

/// 在 heap 中的用途分区
///
/// render target / UAV 类的 texture 生命周期短、经常被 alias，和普通资源分开放
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeapUsage {
    Resource,
    RenderTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureType {
    D2,
    D2Array,
    D3,
    Cube,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_length: u32,
    pub sample_count: u32,
    pub bytes_per_pixel: u32,
    pub usage: TextureUsage,
    pub options: ResourceOptions,
}

// new & init
impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            texture_type: TextureType::D2,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_length: 1,
            sample_count: 1,
            bytes_per_pixel,
            usage: TextureUsage::SHADER_READ,
            options: ResourceOptions::PRIVATE,
        }
    }

    /// 颜色 / 深度附件
    pub fn new_render_target(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            usage: TextureUsage::RENDER_TARGET | TextureUsage::SHADER_READ,
            ..Self::new_2d(width, height, bytes_per_pixel)
        }
    }

    #[inline]
    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    #[inline]
    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    #[inline]
    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    #[inline]
    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }
}

// tools
impl TextureDesc {
    /// render target 和 UAV 都归到 RenderTarget 分区
    #[inline]
    pub fn heap_usage(&self) -> HeapUsage {
        if self.usage.intersects(TextureUsage::RENDER_TARGET | TextureUsage::SHADER_WRITE) {
            HeapUsage::RenderTarget
        } else {
            HeapUsage::Resource
        }
    }

    /// 不考虑对齐的原始字节数，包含整个 mip 链
    pub fn unaligned_size(&self) -> u64 {
        let faces = if self.texture_type == TextureType::Cube { 6 } else { 1 };
        (0..self.mip_levels.max(1))
            .map(|level| {
                let w = (self.width >> level).max(1) as u64;
                let h = (self.height >> level).max(1) as u64;
                let d = (self.depth >> level).max(1) as u64;
                w * h * d
            })
            .sum::<u64>()
            * self.bytes_per_pixel as u64
            * self.array_length.max(1) as u64
            * self.sample_count.max(1) as u64
            * faces
    }
}

/// 资源在 heap 中需要占用的大小和对齐
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeAndAlign {
    pub size: u64,
    pub align: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_size_includes_mips() {
        let desc = TextureDesc::new_2d(4, 4, 4).with_mips(3);
        // 4x4 + 2x2 + 1x1 = 21 texels
        assert_eq!(desc.unaligned_size(), 21 * 4);
    }

    #[test]
    fn test_heap_usage_partition() {
        assert_eq!(TextureDesc::new_2d(8, 8, 4).heap_usage(), HeapUsage::Resource);
        assert_eq!(TextureDesc::new_render_target(8, 8, 4).heap_usage(), HeapUsage::RenderTarget);
        let uav = TextureDesc::new_2d(8, 8, 4).with_usage(TextureUsage::SHADER_WRITE);
        assert_eq!(uav.heap_usage(), HeapUsage::RenderTarget);
    }
}
