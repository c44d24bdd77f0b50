use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::foundation::capabilities::PlatformClass;

/// 命令队列的调试级别
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandDebugLevel {
    #[default]
    Off,
    /// 保留 debug group，失败时在 completion handler 中分类报告
    Logging,
    /// 每次提交后同步等待 GPU 完成并检查错误
    Validation,
}

/// heap 分配器配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapSettings {
    /// buffer 在 region 中的最小对齐
    pub buffer_alignment: u64,
    /// 查找可用 region 时额外向上查看的 bucket 数量
    pub look_ahead: usize,
    /// 只有 bucket 尺寸小于该值时才会向上查看
    pub look_ahead_ceiling: u64,

    /// 每帧碎片整理最多搬运的字节数
    pub defrag_bytes_per_frame: u64,
    /// region 空闲比例超过该值时进行整理
    pub defrag_free_fraction: f32,
    /// region 超过该帧数没有分配时也进行整理
    pub defrag_idle_frames: u64,
    /// region 中所有资源都要比该值（毫秒）更老才允许搬运
    pub defrag_min_age_ms: u64,

    /// 空 region 超过该帧数没有使用时释放
    pub cull_frames: u64,
    /// 软件模拟的 buffer region 空闲超过该帧数时释放
    pub emulated_cull_frames: u64,

    /// 静态 render target heap 占全局 texture 预算的比例，0 表示不使用
    pub static_render_target_fraction: f32,
}

impl HeapSettings {
    pub fn for_platform(platform: PlatformClass) -> Self {
        match platform {
            PlatformClass::Desktop => Self {
                buffer_alignment: 256,
                look_ahead: 1,
                look_ahead_ceiling: 1 << 20,
                defrag_bytes_per_frame: 32 << 20,
                defrag_free_fraction: 0.5,
                defrag_idle_frames: 60,
                defrag_min_age_ms: 1000,
                cull_frames: 30,
                emulated_cull_frames: 60,
                static_render_target_fraction: 0.25,
            },
            PlatformClass::Mobile => Self {
                buffer_alignment: 256,
                look_ahead: 1,
                look_ahead_ceiling: 256 << 10,
                defrag_bytes_per_frame: 4 << 20,
                defrag_free_fraction: 0.5,
                defrag_idle_frames: 60,
                defrag_min_age_ms: 1000,
                cull_frames: 30,
                emulated_cull_frames: 60,
                static_render_target_fraction: 0.25,
            },
        }
    }
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self::for_platform(PlatformClass::Desktop)
    }
}

/// 每个 command encoder 私有的 ring buffer 配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferSettings {
    pub initial_size: u64,
    pub default_alignment: u64,
    /// 扩容后的容量按该粒度向上取整
    pub growth_granularity: u64,
    /// 每隔多少次 shrink 调用评估一次是否缩小
    pub shrink_interval_frames: u32,
}

impl RingBufferSettings {
    pub fn for_platform(platform: PlatformClass) -> Self {
        Self {
            initial_size: match platform {
                PlatformClass::Desktop => 1 << 20,
                PlatformClass::Mobile => 256 << 10,
            },
            default_alignment: 256,
            growth_granularity: 64 << 10,
            shrink_interval_frames: 120,
        }
    }
}

impl Default for RingBufferSettings {
    fn default() -> Self {
        Self::for_platform(PlatformClass::Desktop)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub debug_level: CommandDebugLevel,
    /// 一个 command buffer 中累计多少次 draw / dispatch 后强制提交，0 表示不限制
    pub commit_threshold: u32,
}

/// RHI 的全部可调参数
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhiSettings {
    pub heap: HeapSettings,
    pub ring_buffer: RingBufferSettings,
    pub command: CommandSettings,
}

// new & init
impl RhiSettings {
    pub fn for_platform(platform: PlatformClass) -> Self {
        Self {
            heap: HeapSettings::for_platform(platform),
            ring_buffer: RingBufferSettings::for_platform(platform),
            command: CommandSettings::default(),
        }
    }

    /// 以平台默认值为底，覆盖 toml 中出现的字段
    pub fn from_toml_str(text: &str, platform: PlatformClass) -> anyhow::Result<Self> {
        let overrides: toml::Table = text.parse().context("failed to parse rhi settings toml")?;
        let mut merged = toml::Value::try_from(Self::for_platform(platform)).context("failed to serialize defaults")?;
        merge_toml(&mut merged, toml::Value::Table(overrides));
        merged.try_into().context("invalid rhi settings")
    }

    pub fn load(path: &Path, platform: PlatformClass) -> anyhow::Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("failed to read settings {}", path.display()))?;
        Self::from_toml_str(&text, platform).with_context(|| format!("in settings file {}", path.display()))
    }
}

fn merge_toml(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base), toml::Value::Table(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_toml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
