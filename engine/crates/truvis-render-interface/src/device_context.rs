use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use truvis_rhi::commands::command_list::CommandListKind;
use truvis_rhi::commands::command_queue::CommandQueue;
use truvis_rhi::commands::fence::Fence;
use truvis_rhi::foundation::clock::{Clock, MonotonicClock};
use truvis_rhi::foundation::device::{GpuDevice, RawCommandBuffer, RawTexture};
use truvis_rhi::resources::handles::{BufferHandle, TextureHandle};
use truvis_rhi::resources::heap_allocator::{BufferBinding, HeapAllocator, HeapStats};
use truvis_rhi::resources::resource_desc::{ResourceOptions, TextureDesc};
use truvis_rhi::settings::{RhiSettings, RingBufferSettings};
use truvis_rhi::utilities::lock;

use crate::capture_manager::CaptureManager;
use crate::frame_counter::FrameCounter;
use crate::render_pass::RenderPass;

/// 某一帧释放的资源，等该帧 GPU 完成后才真正归还
#[derive(Default)]
struct FreeList {
    frame: u64,
    buffers: Vec<BufferHandle>,
    textures: Vec<TextureHandle>,
    /// 碎片整理搬走后的旧 texture
    raw_textures: Vec<RawTexture>,
}

impl FreeList {
    #[inline]
    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty() && self.raw_textures.is_empty()
    }
}

/// 在工作线程上录制的并行 context
pub struct ParallelContext {
    index: usize,
    count: usize,
    render_pass: RenderPass,
}

impl ParallelContext {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    #[inline]
    pub fn render_pass_mut(&mut self) -> &mut RenderPass {
        &mut self.render_pass
    }
}

/// deferred render pass 的对象池，可以从任意线程 acquire / release
pub struct ParallelContextPool {
    queue: Arc<CommandQueue>,
    ring_settings: RingBufferSettings,
    free: Mutex<Vec<RenderPass>>,
    created: AtomicU64,
}

impl ParallelContextPool {
    fn new(queue: Arc<CommandQueue>, ring_settings: RingBufferSettings) -> Self {
        Self {
            queue,
            ring_settings,
            free: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
        }
    }

    /// 第 `index` 个（共 `count` 个）并行批次
    pub fn acquire(&self, index: usize, count: usize, start_fence: Option<Fence>) -> ParallelContext {
        let pooled = lock(&self.free).pop();
        let mut render_pass = pooled.unwrap_or_else(|| {
            let id = self.created.fetch_add(1, Ordering::Relaxed);
            RenderPass::new(
                self.queue.clone(),
                CommandListKind::Deferred,
                format!("parallel{id}"),
                self.ring_settings.clone(),
            )
        });
        render_pass.begin(start_fence);
        ParallelContext {
            index,
            count,
            render_pass,
        }
    }

    /// 结束录制并按 index 交给队列，返回该 context 最后的 fence
    pub fn release(&self, mut context: ParallelContext) -> Option<Fence> {
        let _span = tracy_client::span!("ParallelContextPool::release");
        let fence = context.render_pass.end();
        context.render_pass.submit_deferred(context.index, context.count);
        context.render_pass.end_frame();
        lock(&self.free).push(context.render_pass);
        fence
    }

    pub fn pooled_count(&self) -> usize {
        lock(&self.free).len()
    }
}

/// 设备级别的 context：帧生命周期、资源的延迟释放、heap 整理以及并行 context
pub struct DeviceContext {
    device: Arc<dyn GpuDevice>,
    settings: RhiSettings,
    queue: Arc<CommandQueue>,
    heap: Arc<HeapAllocator>,
    capture: CaptureManager,
    render_pass: RenderPass,
    parallel: Arc<ParallelContextPool>,

    frame_counter: FrameCounter,
    frame_active: bool,
    /// 已经完成的帧数，即 id 小于该值的帧都已经执行完毕
    completed_frames: Arc<AtomicU64>,
    in_flight: VecDeque<(u64, RawCommandBuffer)>,
    frame_fence: Option<Fence>,

    current_free: FreeList,
    free_lists: VecDeque<FreeList>,
}

// new & init
impl DeviceContext {
    pub fn new(device: Arc<dyn GpuDevice>, settings: RhiSettings) -> Self {
        Self::with_clock(device, settings, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(device: Arc<dyn GpuDevice>, settings: RhiSettings, clock: Arc<dyn Clock>) -> Self {
        let queue = Arc::new(CommandQueue::new(device.clone(), settings.command.clone()));
        let heap = Arc::new(HeapAllocator::with_clock(device.clone(), settings.heap.clone(), clock));
        let render_pass = RenderPass::new(
            queue.clone(),
            CommandListKind::Immediate,
            "immediate",
            settings.ring_buffer.clone(),
        );
        let parallel = Arc::new(ParallelContextPool::new(queue.clone(), settings.ring_buffer.clone()));

        log::info!(
            "device context created: {:?}, features {:?}",
            device.capabilities().platform,
            device.capabilities().features
        );
        Self {
            device,
            settings,
            queue,
            heap,
            capture: CaptureManager::default(),
            render_pass,
            parallel,
            frame_counter: FrameCounter::new(0),
            frame_active: false,
            completed_frames: Arc::new(AtomicU64::new(0)),
            in_flight: VecDeque::new(),
            frame_fence: None,
            current_free: FreeList::default(),
            free_lists: VecDeque::new(),
        }
    }
}

// getters
impl DeviceContext {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[inline]
    pub fn settings(&self) -> &RhiSettings {
        &self.settings
    }

    #[inline]
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    #[inline]
    pub fn heap(&self) -> &Arc<HeapAllocator> {
        &self.heap
    }

    #[inline]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    #[inline]
    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// 立即 context 的 render pass，只在 begin_frame / end_frame 之间使用
    #[inline]
    pub fn render_pass_mut(&mut self) -> &mut RenderPass {
        &mut self.render_pass
    }

    #[inline]
    pub fn parallel_contexts(&self) -> &Arc<ParallelContextPool> {
        &self.parallel
    }

    #[inline]
    pub fn completed_frames(&self) -> u64 {
        self.completed_frames.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// 等待 GPU 完成后才会释放的帧数
    #[inline]
    pub fn pending_free_lists(&self) -> usize {
        self.free_lists.len()
    }
}

// frame
impl DeviceContext {
    pub fn begin_frame(&mut self) {
        let _span = tracy_client::span!("DeviceContext::begin_frame");
        assert!(!self.frame_active, "begin_frame called twice");

        self.wait_for_frames_in_flight();
        self.release_retired();

        let frame_name = self.frame_counter.frame_name();
        self.capture.begin_frame(self.device.as_ref(), &frame_name);
        self.render_pass.begin(self.frame_fence.take());
        self.frame_active = true;
    }

    /// 帧结束：heap 整理并录制搬运拷贝，挂上帧完成回调后提交
    pub fn end_frame(&mut self) {
        let _span = tracy_client::span!("DeviceContext::end_frame");
        assert!(self.frame_active, "end_frame without begin_frame");
        let frame = self.frame_counter.frame_id();

        self.release_retired();
        let compacted = self.heap.compact(frame, false);
        for relocation in &compacted.relocations {
            self.render_pass.copy_texture(relocation.old, relocation.new);
            self.current_free.raw_textures.push(relocation.old);
        }
        if compacted.released_regions > 0 || !compacted.relocations.is_empty() {
            log::debug!(
                "{} heap compact: {} relocations ({} bytes), {} regions released",
                self.frame_counter.frame_name(),
                compacted.relocations.len(),
                compacted.defrag_bytes,
                compacted.released_regions
            );
        }

        let completed = self.completed_frames.clone();
        self.render_pass.add_completion_handler(move |_| {
            completed.fetch_max(frame + 1, Ordering::AcqRel);
        });
        self.frame_fence = self.render_pass.end();
        if let Some(command_buffer) = self.render_pass.last_committed() {
            self.in_flight.push_back((frame, command_buffer));
        }

        let mut free_list = std::mem::take(&mut self.current_free);
        if !free_list.is_empty() {
            free_list.frame = frame;
            self.free_lists.push_back(free_list);
        }

        self.render_pass.end_frame();
        self.capture.end_frame(self.device.as_ref());
        self.frame_counter.next_frame();
        self.frame_active = false;
    }

    pub fn trigger_capture(&mut self, frames: u32) {
        self.capture.trigger_capture(frames);
    }

    fn wait_for_frames_in_flight(&mut self) {
        loop {
            let completed = self.completed_frames();
            while self.in_flight.front().is_some_and(|&(frame, _)| frame < completed) {
                self.in_flight.pop_front();
            }
            if self.in_flight.len() < FrameCounter::fif_count() {
                return;
            }
            let Some((frame, command_buffer)) = self.in_flight.pop_front() else {
                return;
            };
            let _span = tracy_client::span!("DeviceContext::wait_for_frame");
            log::trace!("waiting for frame {frame}");
            self.queue.wait_until_completed(command_buffer);
            self.completed_frames.fetch_max(frame + 1, Ordering::AcqRel);
        }
    }

    /// 归还所有已完成帧的 free list
    fn release_retired(&mut self) {
        let completed = self.completed_frames();
        while self.free_lists.front().is_some_and(|list| list.frame < completed) {
            let Some(list) = self.free_lists.pop_front() else {
                break;
            };
            self.release_free_list(list);
        }
    }

    fn release_free_list(&self, list: FreeList) {
        for buffer in list.buffers {
            self.heap.release_buffer(buffer);
        }
        for texture in list.textures {
            self.heap.release_texture(texture);
        }
        for raw in list.raw_textures {
            self.device.release_texture(raw);
        }
    }
}

// resources
impl DeviceContext {
    pub fn create_buffer(&self, size: u64, options: ResourceOptions) -> BufferHandle {
        self.heap.create_buffer(size, options)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> TextureHandle {
        self.heap.create_texture(desc)
    }

    pub fn buffer_binding(&self, buffer: BufferHandle) -> BufferBinding {
        self.heap.buffer_binding(buffer)
    }

    pub fn texture_binding(&self, texture: TextureHandle) -> RawTexture {
        self.heap.texture_binding(texture)
    }

    /// 延迟到当前帧完成后释放
    pub fn release_buffer(&mut self, buffer: BufferHandle) {
        self.current_free.buffers.push(buffer);
    }

    pub fn release_texture(&mut self, texture: TextureHandle) {
        self.current_free.textures.push(texture);
    }
}

// parallel
impl DeviceContext {
    /// 跨线程使用时请 clone [`Self::parallel_contexts`] 的 pool
    pub fn acquire_parallel_context(&self, index: usize, count: usize) -> ParallelContext {
        self.parallel.acquire(index, count, None)
    }

    pub fn release_parallel_context(&self, context: ParallelContext) -> Option<Fence> {
        self.parallel.release(context)
    }
}

// destroy
impl DeviceContext {
    /// 等待所有在途的帧并归还全部 free list
    pub fn flush(&mut self) {
        let _span = tracy_client::span!("DeviceContext::flush");
        assert!(!self.frame_active, "flush within a frame");
        while let Some((frame, command_buffer)) = self.in_flight.pop_front() {
            self.queue.wait_until_completed(command_buffer);
            self.completed_frames.fetch_max(frame + 1, Ordering::AcqRel);
        }
        self.completed_frames.fetch_max(self.frame_counter.frame_id(), Ordering::AcqRel);
        self.release_retired();

        // GPU 已空闲，帧外释放的资源可以直接归还
        let free_list = std::mem::take(&mut self.current_free);
        self.release_free_list(free_list);
    }

    pub fn destroy(mut self) {
        if self.frame_active {
            self.end_frame();
        }
        self.flush();
        // GPU 已经空闲，最后一帧的 fence 视为已被 CPU 等待
        if let Some(fence) = self.frame_fence.take() {
            fence.add_waiting_encoder("device idle");
        }
        self.heap.drain_unused(self.frame_counter.frame_id());
        let stats = self.heap.stats();
        log::info!(
            "device context destroyed after {} frames, {} regions / {} direct allocations still alive",
            self.frame_counter.frame_id(),
            stats.region_count,
            stats.direct_allocations
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itertools::Itertools;
    use rayon::prelude::*;
    use truvis_rhi::commands::gpu_command::{GpuCommand, PrimitiveType};
    use truvis_rhi::foundation::capabilities::{GpuCapabilities, PlatformClass};
    use truvis_rhi::foundation::clock::ManualClock;
    use truvis_rhi::foundation::headless_device::HeadlessDevice;
    use truvis_rhi::settings::HeapSettings;

    use super::*;
    use crate::state_cache::{ColorTarget, RenderTargetsInfo};

    fn context(capabilities: GpuCapabilities) -> (Arc<HeadlessDevice>, DeviceContext) {
        let headless = Arc::new(HeadlessDevice::new(capabilities.clone()));
        let settings = RhiSettings::for_platform(capabilities.platform);
        let context = DeviceContext::new(headless.clone(), settings);
        (headless, context)
    }

    #[test]
    fn test_frame_with_render_pass() {
        truvis_crate_tools::init_log::init_test_log();
        let (headless, mut ctx) = context(GpuCapabilities::desktop());
        let rt = ctx.create_texture(&TextureDesc::new_render_target(128, 128, 4));

        for _ in 0..3 {
            ctx.begin_frame();
            let raw = ctx.texture_binding(rt);
            let pass = ctx.render_pass_mut();
            pass.begin_render_pass(RenderTargetsInfo {
                colors: vec![ColorTarget::new(raw)],
                ..Default::default()
            });
            pass.draw_primitive(PrimitiveType::Triangle, 0, 3, 1);
            pass.end_render_pass();
            ctx.end_frame();
        }
        assert_eq!(ctx.frame_counter().frame_id(), 3);
        assert_eq!(ctx.completed_frames(), 3);
        assert_eq!(headless.executed_command_buffers().len(), 3);
        assert!(headless.fence_violations().is_empty());
        ctx.destroy();
    }

    #[test]
    fn test_deferred_release_waits_for_frame_completion() {
        let (headless, mut ctx) = context(GpuCapabilities::desktop());
        headless.set_auto_complete(false);

        ctx.begin_frame();
        let buffer = ctx.create_buffer(100, ResourceOptions::SHARED);
        ctx.end_frame();

        ctx.begin_frame();
        ctx.release_buffer(buffer);
        ctx.end_frame();
        assert_eq!(ctx.heap_stats().live_buffers, 1);
        assert_eq!(ctx.pending_free_lists(), 1);

        ctx.begin_frame();
        assert_eq!(ctx.heap_stats().live_buffers, 1);
        ctx.end_frame();

        headless.complete_all();
        assert_eq!(ctx.completed_frames(), 3);
        ctx.begin_frame();
        assert_eq!(ctx.heap_stats().live_buffers, 0);
        assert_eq!(ctx.pending_free_lists(), 0);
        ctx.end_frame();
        headless.complete_all();
        ctx.destroy();
    }

    #[test]
    fn test_frames_in_flight_are_bounded() {
        let (headless, mut ctx) = context(GpuCapabilities::desktop());
        headless.set_auto_complete(false);
        for _ in 0..6 {
            ctx.begin_frame();
            ctx.end_frame();
            assert!(headless.pending_count() <= FrameCounter::fif_count());
        }
        assert_eq!(ctx.completed_frames(), 3);
        assert_eq!(ctx.frames_in_flight(), 3);
        ctx.flush();
        assert_eq!(ctx.completed_frames(), 6);
        assert_eq!(headless.pending_count(), 0);
        ctx.destroy();
    }

    #[test]
    fn test_capture_brackets_frames() {
        let (headless, mut ctx) = context(GpuCapabilities::mobile());
        ctx.trigger_capture(1);
        for _ in 0..3 {
            ctx.begin_frame();
            ctx.end_frame();
        }
        assert_eq!(headless.captures(), ["capture [F0A]".to_string()]);
        ctx.destroy();
    }

    /// 工作线程以任意顺序完成录制，队列仍然按 index 提交
    #[test]
    fn test_parallel_contexts_submit_in_index_order() {
        let (headless, mut ctx) = context(GpuCapabilities::desktop());
        const COUNT: usize = 8;

        ctx.begin_frame();
        let pool = ctx.parallel_contexts().clone();
        let fences: Vec<Option<Fence>> = (0..COUNT)
            .into_par_iter()
            .map(|index| {
                std::thread::sleep(Duration::from_millis(((COUNT - index) * 3) as u64));
                let mut parallel = pool.acquire(index, COUNT, None);
                parallel.render_pass_mut().push_debug_group(&format!("marker {index}"));
                parallel.render_pass_mut().dispatch([1, 1, 1], [1, 1, 1]);
                parallel.render_pass_mut().pop_debug_group();
                pool.release(parallel)
            })
            .collect();
        for fence in fences.into_iter().flatten() {
            ctx.render_pass_mut().wait(fence);
        }
        ctx.render_pass_mut().dispatch([1, 1, 1], [1, 1, 1]);
        ctx.end_frame();

        let markers = headless
            .executed_command_buffers()
            .iter()
            .flat_map(|cb| cb.commands.clone())
            .filter_map(|command| match command {
                GpuCommand::PushDebugGroup(name) => Some(name),
                _ => None,
            })
            .collect_vec();
        let expected = (0..COUNT).map(|index| format!("marker {index}")).collect_vec();
        assert_eq!(markers, expected);
        assert!(headless.fence_violations().is_empty());
        assert!(pool.pooled_count() >= 1);
        ctx.destroy();
    }

    #[test]
    fn test_parallel_context_is_pooled() {
        let (headless, mut ctx) = context(GpuCapabilities::mobile());
        ctx.begin_frame();
        let src = ctx.buffer_binding(ctx.create_buffer(64, ResourceOptions::SHARED));
        let dst = ctx.buffer_binding(ctx.create_buffer(64, ResourceOptions::SHARED));
        for _ in 0..2 {
            let mut parallel = ctx.acquire_parallel_context(0, 1);
            assert_eq!((parallel.index(), parallel.count()), (0, 1));
            parallel.render_pass_mut().copy_buffer(src.buffer, src.offset, dst.buffer, dst.offset, 64);
            if let Some(fence) = ctx.release_parallel_context(parallel) {
                ctx.render_pass_mut().wait(fence);
            }
        }
        ctx.render_pass_mut().dispatch([1, 1, 1], [1, 1, 1]);
        ctx.end_frame();
        assert_eq!(ctx.parallel_contexts().pooled_count(), 1);
        assert!(headless.fence_violations().is_empty());
        ctx.destroy();
    }

    #[test]
    fn test_defrag_relocations_are_copied_and_retired() {
        let headless = Arc::new(HeadlessDevice::new(GpuCapabilities::desktop()));
        let clock = Arc::new(ManualClock::default());
        let mut settings = RhiSettings::for_platform(PlatformClass::Desktop);
        settings.heap = HeapSettings {
            static_render_target_fraction: 0.0,
            ..settings.heap
        };
        let mut ctx = DeviceContext::with_clock(headless.clone(), settings, clock.clone());

        ctx.begin_frame();
        let desc = TextureDesc::new_2d(256, 256, 4);
        let textures = (0..32).map(|_| ctx.create_texture(&desc)).collect_vec();
        for &texture in textures[1..16].iter().chain(&textures[24..32]) {
            ctx.release_texture(texture);
        }
        ctx.end_frame();

        clock.advance(Duration::from_secs(2));
        ctx.begin_frame();
        let old = ctx.texture_binding(textures[0]);
        ctx.end_frame();

        let new = ctx.texture_binding(textures[0]);
        assert_ne!(old, new);
        let executed = headless.executed_command_buffers();
        let frame1 = executed.last().unwrap();
        assert!(frame1.commands.contains(&GpuCommand::CopyTexture { src: old, dst: new }));
        assert_eq!(headless.live_texture_count(), 10);

        ctx.begin_frame();
        assert_eq!(headless.live_texture_count(), 9);
        ctx.end_frame();
        ctx.destroy();
    }

    /// 关闭时只释放空 region，仍然存活的 texture 不会被搬走
    #[test]
    fn test_destroy_does_not_relocate_live_textures() {
        let headless = Arc::new(HeadlessDevice::new(GpuCapabilities::desktop()));
        let clock = Arc::new(ManualClock::default());
        let mut settings = RhiSettings::for_platform(PlatformClass::Desktop);
        settings.heap.static_render_target_fraction = 0.0;
        let mut ctx = DeviceContext::with_clock(headless.clone(), settings, clock.clone());

        ctx.begin_frame();
        let desc = TextureDesc::new_2d(256, 256, 4);
        let textures = (0..32).map(|_| ctx.create_texture(&desc)).collect_vec();
        for &texture in textures[1..16].iter().chain(&textures[24..32]) {
            ctx.release_texture(texture);
        }
        ctx.end_frame();

        clock.advance(Duration::from_secs(2));
        let executed_before = headless.executed_command_buffers().len();
        ctx.destroy();

        assert_eq!(headless.executed_command_buffers().len(), executed_before);
        assert_eq!(headless.live_heap_count(), 2);
        assert_eq!(headless.live_texture_count(), 9);
    }

    #[test]
    fn test_destroy_drains_everything() {
        let (headless, mut ctx) = context(GpuCapabilities::desktop());
        ctx.begin_frame();
        let buffer = ctx.create_buffer(4096, ResourceOptions::PRIVATE);
        let rt = ctx.create_texture(&TextureDesc::new_render_target(256, 256, 4));
        ctx.release_buffer(buffer);
        ctx.release_texture(rt);
        ctx.end_frame();
        assert!(headless.live_heap_count() > 0);

        ctx.destroy();
        assert_eq!(headless.live_heap_count(), 0);
    }
}
