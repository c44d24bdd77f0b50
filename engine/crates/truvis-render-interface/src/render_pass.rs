use std::sync::Arc;

use bitflags::bitflags;
use truvis_rhi::commands::command_encoder::CommandEncoder;
use truvis_rhi::commands::command_list::{CommandList, CommandListKind};
use truvis_rhi::commands::command_queue::CommandQueue;
use truvis_rhi::commands::fence::Fence;
use truvis_rhi::commands::gpu_command::{IndexType, PrimitiveType};
use truvis_rhi::foundation::capabilities::GpuFeatures;
use truvis_rhi::foundation::device::{RawBuffer, RawCommandBuffer, RawTexture};
use truvis_rhi::foundation::gpu_error::CommandBufferStatus;
use truvis_rhi::settings::RingBufferSettings;

use crate::state_cache::{RenderTargetsInfo, StateCache};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// 提交后立即开始新的 command buffer，仍在 render pass 内时会重启 render encoder
        const CREATE_COMMAND_BUFFER = 1 << 0;
        /// 阻塞到 GPU 完成，只对 immediate list 有效
        const WAIT = 1 << 1;
    }
}

/// 一个 context 的顶层状态机：在 draw / dispatch 请求与 encoder 之间做仲裁
///
/// 主 encoder 录制到主 command buffer；prologue encoder 使用单独的 command buffer，
/// 总是先于主 command buffer 提交，用于异步 blit 和曲面细分的 compute pass。
///
/// fence 的传递是累加的：自上一次 begin / restart 以来结束的每个 encoder 的 fence 都保存在 `fence_chain` 中，
/// 新开始的 encoder 会逐个等待它们。
pub struct RenderPass {
    label: String,
    queue: Arc<CommandQueue>,
    list: CommandList,
    state: StateCache,

    current: CommandEncoder,
    prologue: CommandEncoder,

    pass_start_fence: Option<Fence>,
    current_fence: Option<Fence>,
    prologue_fence: Option<Fence>,
    fence_chain: Vec<Fence>,

    begun: bool,
    within_render_pass: bool,
    outstanding_ops: u32,
    last_committed: Option<RawCommandBuffer>,
    warned_no_tessellation: bool,
}

// new & init
impl RenderPass {
    pub fn new(
        queue: Arc<CommandQueue>,
        kind: CommandListKind,
        label: impl Into<String>,
        ring_settings: RingBufferSettings,
    ) -> Self {
        let label = label.into();
        Self {
            list: CommandList::new(queue.clone(), kind),
            state: StateCache::new(queue.capabilities()),
            current: CommandEncoder::new(queue.clone(), label.clone(), ring_settings.clone()),
            prologue: CommandEncoder::new(queue.clone(), format!("{label}.prologue"), ring_settings),
            queue,
            label,
            pass_start_fence: None,
            current_fence: None,
            prologue_fence: None,
            fence_chain: Vec::new(),
            begun: false,
            within_render_pass: false,
            outstanding_ops: 0,
            last_committed: None,
            warned_no_tessellation: false,
        }
    }
}

// getters
impl RenderPass {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn state(&self) -> &StateCache {
        &self.state
    }

    /// 绑定状态的修改在下一次 draw / dispatch 时提交
    #[inline]
    pub fn state_mut(&mut self) -> &mut StateCache {
        &mut self.state
    }

    #[inline]
    pub fn current_encoder(&self) -> &CommandEncoder {
        &self.current
    }

    #[inline]
    pub fn prologue_encoder(&self) -> &CommandEncoder {
        &self.prologue
    }

    #[inline]
    pub fn list(&self) -> &CommandList {
        &self.list
    }

    #[inline]
    pub fn is_begun(&self) -> bool {
        self.begun
    }

    #[inline]
    pub fn is_within_render_pass(&self) -> bool {
        self.within_render_pass
    }

    #[inline]
    pub fn outstanding_ops(&self) -> u32 {
        self.outstanding_ops
    }

    /// 自上一次 begin / restart 以来结束的 encoder 的 fence
    #[inline]
    pub fn fence_chain(&self) -> &[Fence] {
        &self.fence_chain
    }

    #[inline]
    pub fn pass_start_fence(&self) -> Option<&Fence> {
        self.pass_start_fence.as_ref()
    }

    /// 最近一次结束的主 encoder 的 fence
    #[inline]
    pub fn current_fence(&self) -> Option<&Fence> {
        self.current_fence.as_ref()
    }

    /// 最近一次结束的 prologue encoder 的 fence
    #[inline]
    pub fn prologue_fence(&self) -> Option<&Fence> {
        self.prologue_fence.as_ref()
    }

    /// 最近一次提交的主 command buffer
    #[inline]
    pub fn last_committed(&self) -> Option<RawCommandBuffer> {
        self.last_committed
    }
}

// 生命周期
impl RenderPass {
    /// 每个 command buffer 生命周期开始时调用一次，`start_fence` 是上一个 pass 交出的 fence
    pub fn begin(&mut self, start_fence: Option<Fence>) {
        assert!(!self.begun, "'{}': begin called twice", self.label);
        self.begun = true;
        self.current.start_command_buffer(&mut self.list);
        self.fence_chain = start_fence.iter().cloned().collect();
        self.pass_start_fence = start_fence;
        self.current_fence = None;
        self.prologue_fence = None;
        self.outstanding_ops = 0;
        self.state.invalidate();
    }

    /// 之后开始的 encoder 都等待 `fence`，当前 encoder 立即等待
    pub fn wait(&mut self, fence: Fence) {
        assert!(self.begun, "'{}': wait before begin", self.label);
        if self.current.is_any_active() {
            self.current.wait_for_fence(&fence);
        }
        self.fence_chain.push(fence);
    }

    pub fn begin_render_pass(&mut self, targets: RenderTargetsInfo) {
        let _span = tracy_client::span!("RenderPass::begin_render_pass");
        assert!(!self.within_render_pass, "'{}': begin render pass while already within one", self.label);
        assert!(self.current.has_command_buffer(), "'{}': begin render pass without a command buffer", self.label);

        self.end_encoders(false);
        self.state.set_render_targets(targets);
        self.begin_render_encoder();
        self.state.set_render_targets_active(true);
        self.within_render_pass = true;
    }

    /// 在 render encoder 被切走之后重新开始
    ///
    /// 不给出新的 render target 时，当前 render target 必须可以无损重启
    pub fn restart_render_pass(&mut self, targets: Option<RenderTargetsInfo>) {
        let _span = tracy_client::span!("RenderPass::restart_render_pass");
        assert!(self.within_render_pass, "'{}': restart outside of a render pass", self.label);

        self.end_encoders(true);
        match targets {
            Some(targets) => {
                self.state.set_render_targets_active(false);
                self.state.set_render_targets(targets);
            }
            None => assert!(
                self.state.can_restart_render_pass(),
                "'{}': render pass cannot be restarted, clears or resolves are pending",
                self.label
            ),
        }
        self.begin_render_encoder();
        self.state.set_render_targets_active(true);
    }

    pub fn end_render_pass(&mut self) -> Option<Fence> {
        assert!(self.within_render_pass, "'{}': end render pass outside of a render pass", self.label);
        let fence = self.end_encoders(false);
        self.within_render_pass = false;
        self.state.set_render_targets_active(false);
        self.pass_start_fence = None;
        fence
    }

    /// 结束所有 encoder 并提交，返回交给下一个 pass `begin` 的 fence
    pub fn end(&mut self) -> Option<Fence> {
        let _span = tracy_client::span!("RenderPass::end");
        assert!(self.begun, "'{}': end without begin", self.label);

        if self.within_render_pass {
            self.end_render_pass();
        } else {
            self.end_encoders(false);
        }
        self.commit_command_buffers(false);

        let fence = self.fence_chain.last().cloned();
        self.fence_chain.clear();
        self.pass_start_fence = None;
        self.begun = false;
        self.outstanding_ops = 0;
        self.state.reset();
        fence
    }

    /// 帧结束时收缩 ring buffer
    pub fn end_frame(&mut self) {
        self.current.ring_buffer().shrink();
        self.prologue.ring_buffer().shrink();
    }

    pub fn add_completion_handler(&mut self, handler: impl FnOnce(CommandBufferStatus) + Send + 'static) {
        self.current.add_completion_handler(handler);
    }

    pub fn push_debug_group(&mut self, name: &str) {
        self.current.push_debug_group(name);
    }

    pub fn pop_debug_group(&mut self) {
        self.current.pop_debug_group();
    }

    /// 并行 context：把已经 end 的 command buffer 作为第 `index` 个批次交给队列
    pub fn submit_deferred(&mut self, index: usize, count: usize) {
        assert!(!self.begun, "'{}': submit of a deferred context that has not ended", self.label);
        self.list.submit(index, count);
    }
}

// draw & dispatch
impl RenderPass {
    pub fn draw_primitive(&mut self, primitive: PrimitiveType, vertex_start: u32, vertex_count: u32, instance_count: u32) {
        self.conditional_switch_to_render();
        self.state.commit_render_state(&mut self.current);
        self.current.draw_primitives(primitive, vertex_start, vertex_count, instance_count);
        self.conditional_submit();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed_primitive(
        &mut self,
        primitive: PrimitiveType,
        index_type: IndexType,
        index_buffer: RawBuffer,
        index_offset: u64,
        index_count: u32,
        instance_count: u32,
        base_vertex: i32,
    ) {
        self.conditional_switch_to_render();
        self.state.commit_render_state(&mut self.current);
        self.current.draw_indexed_primitives(
            primitive,
            index_type,
            index_buffer,
            index_offset,
            index_count,
            instance_count,
            base_vertex,
        );
        self.conditional_submit();
    }

    /// 曲面细分绘制：prologue 中的 compute pass 先处理控制点，render encoder 等待其 fence 后绘制
    pub fn draw_patches(&mut self, control_points: u32, patch_start: u32, patch_count: u32, instance_count: u32) {
        if !self.queue.supports_feature(GpuFeatures::TESSELLATION) {
            if !self.warned_no_tessellation {
                log::warn!("'{}': tessellation is not supported, patch draws are skipped", self.label);
                self.warned_no_tessellation = true;
            }
            return;
        }

        self.conditional_switch_to_tessellation();
        self.state.commit_compute_state(&mut self.prologue);
        self.prologue.dispatch([patch_count.max(1), instance_count.max(1), 1], [control_points.max(1), 1, 1]);
        self.state.commit_render_state(&mut self.current);
        self.current.draw_patches(control_points, patch_start, patch_count, instance_count);
        self.conditional_submit();
    }

    pub fn dispatch(&mut self, groups: [u32; 3], threads_per_group: [u32; 3]) {
        self.conditional_switch_to_compute();
        self.state.commit_compute_state(&mut self.current);
        self.current.dispatch(groups, threads_per_group);
        self.conditional_submit();
    }

    pub fn copy_buffer(&mut self, src: RawBuffer, src_offset: u64, dst: RawBuffer, dst_offset: u64, size: u64) {
        self.conditional_switch_to_blit();
        self.current.copy_buffer(src, src_offset, dst, dst_offset, size);
    }

    pub fn copy_texture(&mut self, src: RawTexture, dst: RawTexture) {
        self.conditional_switch_to_blit();
        self.current.copy_texture(src, dst);
    }

    /// 录制到 prologue 的拷贝，在主 command buffer 之前执行
    pub fn async_copy_buffer(&mut self, src: RawBuffer, src_offset: u64, dst: RawBuffer, dst_offset: u64, size: u64) {
        self.conditional_switch_to_async_blit();
        self.prologue.copy_buffer(src, src_offset, dst, dst_offset, size);
    }
}

// encoder 切换
impl RenderPass {
    pub fn conditional_switch_to_render(&mut self) {
        if self.current.is_render_active() {
            return;
        }
        assert!(self.within_render_pass, "'{}': render work outside of a render pass", self.label);
        self.restart_render_pass(None);
    }

    pub fn conditional_switch_to_compute(&mut self) {
        if self.current.is_compute_active() {
            return;
        }
        self.end_current_encoder(self.within_render_pass);
        self.current.begin_compute_command_encoding();
        self.wait_for_pending_fences();
    }

    pub fn conditional_switch_to_blit(&mut self) {
        if self.current.is_blit_active() {
            return;
        }
        self.end_current_encoder(self.within_render_pass);
        self.current.begin_blit_command_encoding();
        self.wait_for_pending_fences();
    }

    /// prologue blit 只等待上一个 pass 的 fence，主 encoder 等待它
    pub fn conditional_switch_to_async_blit(&mut self) {
        if self.prologue.is_blit_active() {
            return;
        }
        self.end_prologue_encoder();
        self.start_prologue_command_buffer();
        self.prologue.begin_blit_command_encoding();
        self.prologue_waits_for_pass_start();
        self.current_waits_for_prologue();
    }

    /// render encoder 与 prologue compute encoder 同时处于活动状态，render 一侧等待 compute 一侧的 fence
    pub fn conditional_switch_to_tessellation(&mut self) {
        self.conditional_switch_to_render();
        if self.prologue.is_compute_active() {
            return;
        }
        self.end_prologue_encoder();
        self.start_prologue_command_buffer();
        self.prologue.begin_compute_command_encoding();
        self.prologue_waits_for_pass_start();
        self.current_waits_for_prologue();
    }

    /// 超过提交阈值时提前提交，对调用者不可见
    ///
    /// 存在多重采样 resolve 或 render target 无法无损重启时不拆分
    pub fn conditional_submit(&mut self) {
        self.outstanding_ops += 1;
        let threshold = self.queue.settings().commit_threshold;
        if threshold == 0 || self.outstanding_ops < threshold {
            return;
        }
        if self.within_render_pass && (self.state.has_pending_resolve() || !self.state.can_restart_render_pass()) {
            return;
        }
        log::trace!("'{}': {} outstanding ops, submitting early", self.label, self.outstanding_ops);
        self.submit(SubmitFlags::CREATE_COMMAND_BUFFER);
    }

    /// 结束所有 encoder 并提交；在 render pass 中时用 Load 重启 render encoder
    pub fn submit(&mut self, flags: SubmitFlags) {
        let _span = tracy_client::span!("RenderPass::submit");
        assert!(self.begun, "'{}': submit without begin", self.label);
        assert!(
            !self.within_render_pass || flags.contains(SubmitFlags::CREATE_COMMAND_BUFFER),
            "'{}': submit within a render pass must start a new command buffer",
            self.label
        );

        self.end_encoders(self.within_render_pass);
        self.commit_command_buffers(flags.contains(SubmitFlags::WAIT));
        self.outstanding_ops = 0;

        if flags.contains(SubmitFlags::CREATE_COMMAND_BUFFER) {
            self.current.start_command_buffer(&mut self.list);
            if self.within_render_pass {
                self.begin_render_encoder_with_loads();
            }
        } else {
            self.begun = false;
        }
    }
}

// tools
impl RenderPass {
    fn begin_render_encoder(&mut self) {
        let Some(descriptor) = self.state.render_pass_descriptor().cloned() else {
            panic!("'{}': render encoder without render targets", self.label);
        };
        self.current.set_render_pass_descriptor(descriptor);
        self.current.begin_render_command_encoding();
        self.wait_for_pending_fences();
        self.fence_chain.clear();
    }

    /// 提前提交后的重启：所有 load 都改为 Load，之后的绘制累加到同一组 render target
    fn begin_render_encoder_with_loads(&mut self) {
        let Some(mut descriptor) = self.state.render_pass_descriptor().cloned() else {
            panic!("'{}': render encoder without render targets", self.label);
        };
        descriptor.rewrite_loads_to_load();
        self.current.set_render_pass_descriptor(descriptor);
        self.current.begin_render_command_encoding();
        self.wait_for_pending_fences();
        self.fence_chain.clear();
    }

    /// 新开始的主 encoder 等待 fence chain 中的全部 fence 以及未结束的 prologue
    fn wait_for_pending_fences(&mut self) {
        for fence in &self.fence_chain {
            self.current.wait_for_fence(fence);
        }
        self.current_waits_for_prologue();
        self.state.invalidate();
    }

    fn current_waits_for_prologue(&mut self) {
        if !self.current.is_any_active() {
            return;
        }
        if let Some(fence) = self.prologue.current_fence().cloned() {
            self.current.wait_for_fence(&fence);
        }
    }

    fn prologue_waits_for_pass_start(&mut self) {
        if let Some(fence) = self.pass_start_fence.clone() {
            self.prologue.wait_for_fence(&fence);
        }
    }

    fn start_prologue_command_buffer(&mut self) {
        if !self.prologue.has_command_buffer() {
            self.prologue.start_command_buffer(&mut self.list);
        }
    }

    /// 主 encoder 结束时 store action 由状态缓存决定
    fn end_current_encoder(&mut self, mid_pass: bool) -> Option<Fence> {
        if !self.current.is_any_active() {
            return None;
        }
        if self.current.is_render_active() && self.state.uses_deferred_store_actions() {
            self.current.set_render_pass_store_actions(self.state.store_actions(mid_pass));
        }
        let fence = self.current.end_encoding();
        self.fence_chain.push(fence.clone());
        self.current_fence = Some(fence.clone());
        Some(fence)
    }

    fn end_prologue_encoder(&mut self) -> Option<Fence> {
        if !self.prologue.is_any_active() {
            return None;
        }
        let fence = self.prologue.end_encoding();
        self.fence_chain.push(fence.clone());
        self.prologue_fence = Some(fence.clone());
        Some(fence)
    }

    fn end_encoders(&mut self, mid_pass: bool) -> Option<Fence> {
        let prologue = self.end_prologue_encoder();
        self.end_current_encoder(mid_pass).or(prologue)
    }

    /// prologue 的 command buffer 总是先于主 command buffer 提交
    fn commit_command_buffers(&mut self, wait: bool) {
        let wait = wait && self.list.is_immediate();
        if self.prologue.has_command_buffer() {
            self.prologue.commit_command_buffer(&mut self.list, false);
        }
        if let Some(command_buffer) = self.current.command_buffer() {
            self.last_committed = Some(command_buffer.raw());
            self.current.commit_command_buffer(&mut self.list, wait);
        }
    }
}
