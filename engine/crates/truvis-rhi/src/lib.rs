//! Truvis RHI (Rendering Hardware Interface) 底层
//!
//! 提供命令队列 / 命令列表 / 命令编码器、fence 同步、每个编码器私有的 ring buffer，
//! 以及按尺寸分桶并支持碎片整理的 heap 分配器。
//!
//! 底层图形 API 通过 [`foundation::device::GpuDevice`] trait 接入，
//! [`foundation::headless_device::HeadlessDevice`] 是一个不依赖 GPU 的软件实现，
//! 会记录并执行所有命令，用于测试和无窗口运行。

pub mod commands;
pub mod foundation;
pub mod resources;
pub mod settings;
pub mod utilities;
