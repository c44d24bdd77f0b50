use bitflags::bitflags;

bitflags! {
    /// 底层图形 API 的可选特性
    ///
    /// 在初始化时一次性查询，之后所有的逻辑分支只依赖这些 bit，而不是编译期的平台
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GpuFeatures: u32 {
        /// 真正的 heap 对象，可以在 heap 内放置 buffer / texture
        const HEAPS = 1 << 0;
        /// 跨编码器的 GPU fence
        const FENCES = 1 << 1;
        /// 不占用显存、只存在于 tile memory 的 texture
        const MEMORYLESS_TEXTURES = 1 << 2;
        /// 硬件曲面细分（需要 compute 的 prologue pass）
        const TESSELLATION = 1 << 3;
        /// render pass 的 store action 可以延迟到编码结束时再指定
        const DEFERRED_STORE_ACTIONS = 1 << 4;
    }
}

/// 平台类别，影响 bucket 表、碎片整理预算以及 GPU 超时错误是否致命
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlatformClass {
    Desktop,
    Mobile,
}

/// 设备能力，初始化时解析一次
#[derive(Clone, Debug)]
pub struct GpuCapabilities {
    pub features: GpuFeatures,
    pub platform: PlatformClass,
    /// 全局 texture 显存预算（字节），用于计算静态 render target heap 的大小
    pub texture_memory_budget: u64,
}

impl GpuCapabilities {
    pub fn desktop() -> Self {
        Self {
            features: GpuFeatures::HEAPS
                | GpuFeatures::FENCES
                | GpuFeatures::TESSELLATION
                | GpuFeatures::DEFERRED_STORE_ACTIONS,
            platform: PlatformClass::Desktop,
            texture_memory_budget: 2 << 30,
        }
    }

    pub fn mobile() -> Self {
        Self {
            features: GpuFeatures::HEAPS
                | GpuFeatures::FENCES
                | GpuFeatures::MEMORYLESS_TEXTURES
                | GpuFeatures::DEFERRED_STORE_ACTIONS,
            platform: PlatformClass::Mobile,
            texture_memory_budget: 512 << 20,
        }
    }

    /// 没有任何可选特性的最低配置，所有的 fallback 路径都会被走到
    pub fn minimal(platform: PlatformClass) -> Self {
        Self {
            features: GpuFeatures::empty(),
            platform,
            texture_memory_budget: 256 << 20,
        }
    }

    #[inline]
    pub fn with_features(mut self, features: GpuFeatures) -> Self {
        self.features = features;
        self
    }

    #[inline]
    pub fn supports(&self, feature: GpuFeatures) -> bool {
        self.features.contains(feature)
    }
}
