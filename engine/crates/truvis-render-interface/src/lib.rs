//! 渲染层与 RHI 之间的边界
//!
//! - [`state_cache::StateCache`]：缓存 render target 与管线状态，决定 load / store action
//! - [`render_pass::RenderPass`]：按需切换 render / compute / blit 编码器，并维护 fence 链
//! - [`device_context::DeviceContext`]：帧的开始与结束、资源的延迟释放以及并行 context

pub mod capture_manager;
pub mod device_context;
pub mod frame_counter;
pub mod render_pass;
pub mod state_cache;
