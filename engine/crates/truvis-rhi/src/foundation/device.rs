use crate::commands::gpu_command::GpuCommand;
use crate::foundation::capabilities::GpuCapabilities;
use crate::foundation::gpu_error::CommandBufferStatus;
use crate::resources::resource_desc::{ResourceOptions, SizeAndAlign, TextureDesc};

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

raw_handle! {
    /// 设备侧 buffer 对象
    RawBuffer;
    /// 设备侧 texture 对象
    RawTexture;
    /// 设备侧 heap，可以在其中放置 buffer / texture
    RawHeap;
    /// 设备侧的 GPU fence
    RawFence;
    RawCommandBuffer;
}

/// command buffer 执行完成后的回调，可能在任意线程上被调用
pub type CompletionHandler = Box<dyn FnOnce(CommandBufferStatus) + Send>;

/// 底层图形 API 的最小接口
///
/// 所有创建函数返回 `None` 表示设备内存不足或者不支持该操作，由调用方决定是否回退。
pub trait GpuDevice: Send + Sync {
    fn capabilities(&self) -> &GpuCapabilities;

    // buffer / texture
    fn new_buffer(&self, size: u64, options: ResourceOptions) -> Option<RawBuffer>;
    fn new_texture(&self, desc: &TextureDesc) -> Option<RawTexture>;
    fn texture_size_and_align(&self, desc: &TextureDesc) -> SizeAndAlign;
    fn release_buffer(&self, buffer: RawBuffer);
    fn release_texture(&self, texture: RawTexture);
    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]);

    // heap
    fn new_heap(&self, size: u64, options: ResourceOptions) -> Option<RawHeap>;
    fn new_placed_buffer(&self, heap: RawHeap, offset: u64, size: u64, options: ResourceOptions) -> Option<RawBuffer>;
    fn new_placed_texture(&self, heap: RawHeap, offset: u64, desc: &TextureDesc) -> Option<RawTexture>;
    fn release_heap(&self, heap: RawHeap);

    // sync
    fn new_fence(&self, label: &str) -> Option<RawFence>;
    fn release_fence(&self, fence: RawFence);

    // command buffer
    fn new_command_buffer(&self, label: &str) -> RawCommandBuffer;
    fn encode(&self, command_buffer: RawCommandBuffer, command: GpuCommand);
    /// 提交后 command buffer 不能再写入，完成时按顺序调用 `handlers`
    fn commit(&self, command_buffer: RawCommandBuffer, handlers: Vec<CompletionHandler>);
    fn wait_until_completed(&self, command_buffer: RawCommandBuffer) -> CommandBufferStatus;

    // capture
    fn begin_capture_scope(&self, label: &str);
    fn end_capture_scope(&self);
}
