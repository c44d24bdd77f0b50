use std::sync::Arc;

use crate::commands::command_buffer::CommandBuffer;
use crate::commands::command_list::CommandList;
use crate::commands::command_queue::CommandQueue;
use crate::commands::encoder_bindings::EncoderBindings;
use crate::commands::fence::Fence;
use crate::commands::gpu_command::{
    EncoderKind, GpuCommand, IndexType, PipelineHandle, PrimitiveType, SamplerHandle, ScissorRect, ShaderStage,
    Viewport,
};
use crate::commands::render_pass_desc::{RenderPassDescriptor, StoreActions};
use crate::foundation::capabilities::GpuFeatures;
use crate::foundation::device::{RawBuffer, RawTexture};
use crate::foundation::gpu_error::CommandBufferStatus;
use crate::resources::resource_desc::ResourceOptions;
use crate::resources::ring_buffer::{RingAllocation, RingBuffer};
use crate::settings::RingBufferSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    NoEncoder,
    Render,
    Compute,
    Blit,
}

impl From<EncoderKind> for EncoderState {
    fn from(kind: EncoderKind) -> Self {
        match kind {
            EncoderKind::Render => Self::Render,
            EncoderKind::Compute => Self::Compute,
            EncoderKind::Blit => Self::Blit,
        }
    }
}

/// 一个 command buffer 上的编码器状态机
///
/// 同一时刻最多只有一种 render / compute / blit encoder 处于活动状态，
/// begin 只能在 NoEncoder 状态调用，由调用方先结束上一个 encoder。
/// 每个 encoder 开始时创建自己的 fence，结束时在命令流里 update 该 fence 并交还给调用方。
pub struct CommandEncoder {
    label: String,
    queue: Arc<CommandQueue>,

    command_buffer: Option<CommandBuffer>,
    state: EncoderState,
    encoder_label: String,
    encoder_count: u32,
    fence: Option<Fence>,

    descriptor: Option<RenderPassDescriptor>,
    store_actions_set: bool,

    bindings: EncoderBindings,
    ring_buffer: RingBuffer,
}

// new & init
impl CommandEncoder {
    pub fn new(queue: Arc<CommandQueue>, label: impl Into<String>, ring_settings: RingBufferSettings) -> Self {
        let ring_buffer = RingBuffer::new(queue.device().clone(), ring_settings, ResourceOptions::SHARED_WRITE_COMBINED);
        Self {
            label: label.into(),
            queue,
            command_buffer: None,
            state: EncoderState::NoEncoder,
            encoder_label: String::new(),
            encoder_count: 0,
            fence: None,
            descriptor: None,
            store_actions_set: false,
            bindings: EncoderBindings::default(),
            ring_buffer,
        }
    }
}

// getters
impl CommandEncoder {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn state(&self) -> EncoderState {
        self.state
    }

    #[inline]
    pub fn has_command_buffer(&self) -> bool {
        self.command_buffer.is_some()
    }

    #[inline]
    pub fn command_buffer(&self) -> Option<&CommandBuffer> {
        self.command_buffer.as_ref()
    }

    #[inline]
    pub fn is_render_active(&self) -> bool {
        self.state == EncoderState::Render
    }

    #[inline]
    pub fn is_compute_active(&self) -> bool {
        self.state == EncoderState::Compute
    }

    #[inline]
    pub fn is_blit_active(&self) -> bool {
        self.state == EncoderState::Blit
    }

    #[inline]
    pub fn is_any_active(&self) -> bool {
        self.state != EncoderState::NoEncoder
    }

    /// 当前 encoder 的 fence，encoder 结束后为 None
    #[inline]
    pub fn current_fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    #[inline]
    pub fn render_pass_descriptor(&self) -> Option<&RenderPassDescriptor> {
        self.descriptor.as_ref()
    }

    #[inline]
    pub fn ring_buffer(&self) -> &RingBuffer {
        &self.ring_buffer
    }

    #[inline]
    pub fn bindings(&self) -> &EncoderBindings {
        &self.bindings
    }

    fn active_command_buffer(&self) -> &CommandBuffer {
        match &self.command_buffer {
            Some(command_buffer) => command_buffer,
            None => panic!("'{}': no command buffer", self.label),
        }
    }

    fn active_command_buffer_mut(&mut self) -> &mut CommandBuffer {
        match &mut self.command_buffer {
            Some(command_buffer) => command_buffer,
            None => panic!("'{}': no command buffer", self.label),
        }
    }
}

// command buffer
impl CommandEncoder {
    pub fn start_command_buffer(&mut self, list: &mut CommandList) {
        assert!(self.command_buffer.is_none(), "'{}': command buffer already started", self.label);
        assert_eq!(self.state, EncoderState::NoEncoder);
        let label = format!("{} #{}", self.label, self.encoder_count);
        self.command_buffer = Some(list.create_command_buffer(&label));
        self.bindings.reset();
    }

    /// 提交当前 command buffer，之前必须已经结束所有 encoder
    pub fn commit_command_buffer(&mut self, list: &mut CommandList, wait: bool) {
        let _span = tracy_client::span!("CommandEncoder::commit_command_buffer");
        assert_eq!(self.state, EncoderState::NoEncoder, "'{}': end encoding before commit", self.label);
        let Some(mut command_buffer) = self.command_buffer.take() else {
            panic!("'{}': commit without a command buffer", self.label);
        };
        self.ring_buffer.commit(&mut command_buffer);
        list.commit(command_buffer, wait);
        self.descriptor = None;
        self.bindings.reset();
    }

    pub fn add_completion_handler(&mut self, handler: impl FnOnce(CommandBufferStatus) + Send + 'static) {
        self.active_command_buffer_mut().add_completion_handler(handler);
    }

    pub fn push_debug_group(&mut self, name: &str) {
        self.active_command_buffer_mut().push_debug_group(name);
    }

    pub fn pop_debug_group(&mut self) {
        self.active_command_buffer_mut().pop_debug_group();
    }
}

// encoder 生命周期
impl CommandEncoder {
    /// 只能在 NoEncoder 状态设置
    pub fn set_render_pass_descriptor(&mut self, descriptor: RenderPassDescriptor) {
        assert_eq!(
            self.state,
            EncoderState::NoEncoder,
            "'{}': render pass descriptor set while an encoder is active",
            self.label
        );
        self.descriptor = Some(descriptor);
        self.store_actions_set = false;
    }

    pub fn begin_render_command_encoding(&mut self) {
        let Some(descriptor) = self.descriptor.clone() else {
            panic!("'{}': begin render encoding without a render pass descriptor", self.label);
        };
        let label = self.begin_encoder(EncoderKind::Render);
        self.active_command_buffer().encode(GpuCommand::BeginRenderEncoder { label, descriptor });
    }

    pub fn begin_compute_command_encoding(&mut self) {
        let label = self.begin_encoder(EncoderKind::Compute);
        self.active_command_buffer().encode(GpuCommand::BeginComputeEncoder { label });
    }

    pub fn begin_blit_command_encoding(&mut self) {
        let label = self.begin_encoder(EncoderKind::Blit);
        self.active_command_buffer().encode(GpuCommand::BeginBlitEncoder { label });
    }

    fn begin_encoder(&mut self, kind: EncoderKind) -> String {
        assert!(self.command_buffer.is_some(), "'{}': begin {kind:?} encoding without a command buffer", self.label);
        assert_eq!(
            self.state,
            EncoderState::NoEncoder,
            "'{}': begin {kind:?} encoding while {:?} is active",
            self.label,
            self.state
        );

        self.encoder_count += 1;
        self.encoder_label = format!("{}.{kind:?}{}", self.label, self.encoder_count);
        self.fence = Some(self.queue.create_fence(&self.encoder_label));
        self.state = kind.into();
        self.store_actions_set = false;
        self.bindings.reset();
        self.encoder_label.clone()
    }

    /// 设置 render target 真实的 store action，需要在 descriptor 设置之后、encoder 结束之前
    pub fn set_render_pass_store_actions(&mut self, actions: StoreActions) {
        assert!(self.descriptor.is_some(), "'{}': store actions without a render pass descriptor", self.label);
        assert!(self.is_render_active(), "'{}': store actions after the render encoder ended", self.label);
        if let Some(descriptor) = self.descriptor.as_mut() {
            descriptor.set_store_actions(&actions);
        }
        if self.queue.supports_feature(GpuFeatures::DEFERRED_STORE_ACTIONS) {
            self.active_command_buffer().encode(GpuCommand::SetStoreActions(actions));
        }
        self.store_actions_set = true;
    }

    #[inline]
    pub fn store_actions_set(&self) -> bool {
        self.store_actions_set
    }

    /// 结束当前 encoder，返回代表“该 encoder 编码的全部 GPU 工作”的 fence
    pub fn end_encoding(&mut self) -> Fence {
        assert!(self.is_any_active(), "'{}': end encoding without an active encoder", self.label);
        let Some(fence) = self.fence.take() else {
            panic!("'{}': active encoder without a fence", self.label);
        };

        if let Some(raw) = fence.raw() {
            let command_buffer = self.active_command_buffer_mut();
            command_buffer.encode(GpuCommand::UpdateFence(raw));
            command_buffer.retain_fence(&fence);
        }
        fence.add_updating_encoder(&self.encoder_label);
        self.active_command_buffer().encode(GpuCommand::EndEncoding);
        self.state = EncoderState::NoEncoder;
        fence
    }

    /// 当前 encoder 等待 `fence`
    pub fn wait_for_fence(&mut self, fence: &Fence) {
        assert!(self.is_any_active(), "'{}': wait for fence without an active encoder", self.label);
        if let Some(raw) = fence.raw() {
            let command_buffer = self.active_command_buffer_mut();
            command_buffer.encode(GpuCommand::WaitForFence(raw));
            command_buffer.retain_fence(fence);
        }
        fence.add_waiting_encoder(&self.encoder_label);
    }
}

// 状态绑定
impl CommandEncoder {
    pub fn set_render_pipeline(&mut self, pipeline: PipelineHandle) {
        assert!(self.is_render_active());
        self.active_command_buffer().encode(GpuCommand::SetRenderPipeline(pipeline));
    }

    pub fn set_compute_pipeline(&mut self, pipeline: PipelineHandle) {
        assert!(self.is_compute_active());
        self.active_command_buffer().encode(GpuCommand::SetComputePipeline(pipeline));
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        assert!(self.is_render_active());
        self.active_command_buffer().encode(GpuCommand::SetViewport(viewport));
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        assert!(self.is_render_active());
        self.active_command_buffer().encode(GpuCommand::SetScissorRect(rect));
    }

    pub fn set_shader_buffer(&mut self, stage: ShaderStage, index: u32, buffer: RawBuffer, offset: u64) {
        assert!(self.is_any_active(), "'{}': binding without an active encoder", self.label);
        if self.bindings.set_buffer(stage, index, buffer, offset) {
            self.active_command_buffer().encode(GpuCommand::SetBuffer {
                stage,
                index,
                buffer,
                offset,
            });
        }
    }

    /// 通过 ring buffer 上传一段临时数据并绑定
    pub fn set_shader_bytes(&mut self, stage: ShaderStage, index: u32, bytes: &[u8]) -> RingAllocation {
        let allocation = self.ring_buffer.upload(bytes, 0);
        self.set_shader_buffer(stage, index, allocation.buffer, allocation.offset);
        allocation
    }

    pub fn set_shader_data<T: bytemuck::Pod>(&mut self, stage: ShaderStage, index: u32, data: &T) -> RingAllocation {
        self.set_shader_bytes(stage, index, bytemuck::bytes_of(data))
    }

    pub fn set_shader_texture(&mut self, stage: ShaderStage, index: u32, texture: RawTexture) {
        assert!(self.is_any_active(), "'{}': binding without an active encoder", self.label);
        if self.bindings.set_texture(stage, index, texture) {
            self.active_command_buffer().encode(GpuCommand::SetTexture { stage, index, texture });
        }
    }

    pub fn set_shader_sampler(&mut self, stage: ShaderStage, index: u32, sampler: SamplerHandle) {
        assert!(self.is_any_active(), "'{}': binding without an active encoder", self.label);
        if self.bindings.set_sampler(stage, index, sampler) {
            self.active_command_buffer().encode(GpuCommand::SetSampler { stage, index, sampler });
        }
    }
}

// draw / dispatch / copy
impl CommandEncoder {
    pub fn draw_primitives(&mut self, primitive: PrimitiveType, vertex_start: u32, vertex_count: u32, instance_count: u32) {
        assert!(self.is_render_active(), "'{}': draw without a render encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::Draw {
            primitive,
            vertex_start,
            vertex_count,
            instance_count,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed_primitives(
        &mut self,
        primitive: PrimitiveType,
        index_type: IndexType,
        index_buffer: RawBuffer,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
    ) {
        assert!(self.is_render_active(), "'{}': draw without a render encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::DrawIndexed {
            primitive,
            index_type,
            index_buffer,
            index_offset,
            index_count,
            instance_count,
            base_vertex,
        });
    }

    pub fn draw_patches(&mut self, control_points: u32, patch_start: u32, patch_count: u32, instance_count: u32) {
        assert!(self.is_render_active(), "'{}': draw patches without a render encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::DrawPatches {
            control_points,
            patch_start,
            patch_count,
            instance_count,
        });
    }

    pub fn dispatch(&mut self, groups: [u32; 3], threads_per_group: [u32; 3]) {
        assert!(self.is_compute_active(), "'{}': dispatch without a compute encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::Dispatch {
            groups,
            threads_per_group,
        });
    }

    pub fn copy_buffer(&mut self, src: RawBuffer, src_offset: u64, dst: RawBuffer, dst_offset: u64, size: u64) {
        assert!(self.is_blit_active(), "'{}': copy without a blit encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_texture(&mut self, src: RawTexture, dst: RawTexture) {
        assert!(self.is_blit_active(), "'{}': copy without a blit encoder", self.label);
        self.active_command_buffer().encode(GpuCommand::CopyTexture { src, dst });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command_list::CommandListKind;
    use crate::commands::render_pass_desc::{AttachmentDesc, ClearValue, StoreAction};
    use crate::foundation::capabilities::{GpuCapabilities, PlatformClass};
    use crate::foundation::device::GpuDevice;
    use crate::foundation::headless_device::HeadlessDevice;
    use crate::resources::resource_desc::TextureDesc;
    use crate::settings::CommandSettings;

    fn setup(capabilities: GpuCapabilities) -> (Arc<HeadlessDevice>, CommandList, CommandEncoder) {
        let headless = Arc::new(HeadlessDevice::new(capabilities));
        let queue = Arc::new(CommandQueue::new(headless.clone(), CommandSettings::default()));
        let list = CommandList::new(queue.clone(), CommandListKind::Immediate);
        let encoder = CommandEncoder::new(queue, "main", RingBufferSettings::default());
        (headless, list, encoder)
    }

    #[test]
    fn test_encoder_state_machine_and_fences() {
        let (headless, mut list, mut encoder) = setup(GpuCapabilities::desktop());
        let rt = headless.new_texture(&TextureDesc::new_render_target(16, 16, 4)).unwrap();

        encoder.start_command_buffer(&mut list);
        encoder.set_render_pass_descriptor(RenderPassDescriptor {
            color_attachments: vec![AttachmentDesc::new(rt, ClearValue::Color([0.0; 4]))],
            ..Default::default()
        });
        encoder.begin_render_command_encoding();
        assert!(encoder.is_render_active());
        assert!(encoder.current_fence().is_some());
        encoder.draw_primitives(PrimitiveType::Triangle, 0, 3, 1);
        let render_fence = encoder.end_encoding();
        assert!(encoder.current_fence().is_none());

        encoder.begin_compute_command_encoding();
        encoder.wait_for_fence(&render_fence);
        encoder.dispatch([1, 1, 1], [64, 1, 1]);
        let compute_fence = encoder.end_encoding();
        assert!(render_fence.is_balanced());

        encoder.begin_blit_command_encoding();
        encoder.wait_for_fence(&compute_fence);
        let _blit_fence = encoder.end_encoding();
        encoder.commit_command_buffer(&mut list, false);

        assert!(headless.fence_violations().is_empty());
        let executed = headless.executed_command_buffers();
        let updates = executed[0].commands.iter().filter(|c| matches!(c, GpuCommand::UpdateFence(_))).count();
        assert_eq!(updates, 3);
    }

    #[test]
    fn test_binding_dedup_and_reset_per_encoder() {
        let (headless, mut list, mut encoder) = setup(GpuCapabilities::desktop());
        encoder.start_command_buffer(&mut list);
        encoder.begin_compute_command_encoding();
        encoder.set_shader_buffer(ShaderStage::Compute, 0, RawBuffer(99), 0);
        encoder.set_shader_buffer(ShaderStage::Compute, 0, RawBuffer(99), 0);
        let _ = encoder.end_encoding();
        encoder.begin_compute_command_encoding();
        encoder.set_shader_buffer(ShaderStage::Compute, 0, RawBuffer(99), 0);
        let allocation = encoder.set_shader_data(ShaderStage::Compute, 1, &[1.0f32, 2.0, 3.0, 4.0]);
        let _ = encoder.end_encoding();
        encoder.commit_command_buffer(&mut list, false);

        let executed = headless.executed_command_buffers();
        let binds = executed[0].commands.iter().filter(|c| matches!(c, GpuCommand::SetBuffer { .. })).count();
        assert_eq!(binds, 3);
        assert_eq!(headless.buffer_contents(allocation.buffer, allocation.offset, 4), 1.0f32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_store_actions_without_deferred_support_are_not_encoded() {
        let caps = GpuCapabilities::desktop().with_features(GpuFeatures::HEAPS | GpuFeatures::FENCES);
        let (headless, mut list, mut encoder) = setup(caps);
        encoder.start_command_buffer(&mut list);
        encoder.set_render_pass_descriptor(RenderPassDescriptor::default());
        encoder.begin_render_command_encoding();
        encoder.set_render_pass_store_actions(StoreActions {
            color: vec![StoreAction::Store],
            ..Default::default()
        });
        assert!(encoder.store_actions_set());
        let _ = encoder.end_encoding();
        encoder.commit_command_buffer(&mut list, true);
        let executed = headless.executed_command_buffers();
        assert!(!executed[0].commands.iter().any(|c| matches!(c, GpuCommand::SetStoreActions(_))));
    }

    #[test]
    fn test_null_fences_without_fence_support() {
        let (headless, mut list, mut encoder) = setup(GpuCapabilities::minimal(PlatformClass::Mobile));
        encoder.start_command_buffer(&mut list);
        encoder.begin_compute_command_encoding();
        let fence = encoder.end_encoding();
        assert!(fence.is_null());
        encoder.begin_blit_command_encoding();
        encoder.wait_for_fence(&fence);
        let _ = encoder.end_encoding();
        encoder.commit_command_buffer(&mut list, false);
        assert!(headless.fence_violations().is_empty());
    }

    #[test]
    #[should_panic(expected = "while Compute is active")]
    fn test_begin_requires_no_encoder() {
        let (_headless, mut list, mut encoder) = setup(GpuCapabilities::desktop());
        encoder.start_command_buffer(&mut list);
        encoder.begin_compute_command_encoding();
        encoder.begin_blit_command_encoding();
    }

    #[test]
    #[should_panic(expected = "render pass descriptor set while an encoder is active")]
    fn test_descriptor_only_from_no_encoder() {
        let (_headless, mut list, mut encoder) = setup(GpuCapabilities::desktop());
        encoder.start_command_buffer(&mut list);
        encoder.begin_compute_command_encoding();
        encoder.set_render_pass_descriptor(RenderPassDescriptor::default());
    }
}
