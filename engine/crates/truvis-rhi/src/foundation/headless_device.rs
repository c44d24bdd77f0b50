use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::commands::gpu_command::GpuCommand;
use crate::commands::render_pass_desc::{AttachmentDesc, ClearValue, LoadAction, RenderPassDescriptor, StoreAction};
use crate::foundation::capabilities::{GpuCapabilities, GpuFeatures};
use crate::foundation::device::{
    CompletionHandler, GpuDevice, RawBuffer, RawCommandBuffer, RawFence, RawHeap, RawTexture,
};
use crate::foundation::gpu_error::{CommandBufferStatus, GpuErrorKind};
use crate::resources::resource_desc::{ResourceOptions, SizeAndAlign, TextureDesc, TextureUsage};
use crate::utilities::{align_up, lock};

/// render target 上发生过的光栅化事件，用来比较两次渲染的最终结果
#[derive(Clone, Debug, PartialEq)]
pub enum RasterEvent {
    Clear(ClearValue),
    Draw { vertex_start: u32, vertex_count: u32, instance_count: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, base_vertex: i32 },
    DrawPatches { patch_start: u32, patch_count: u32, instance_count: u32 },
}

impl RasterEvent {
    fn from_command(command: &GpuCommand) -> Option<Self> {
        match *command {
            GpuCommand::Draw {
                vertex_start,
                vertex_count,
                instance_count,
                ..
            } => Some(Self::Draw {
                vertex_start,
                vertex_count,
                instance_count,
            }),
            GpuCommand::DrawIndexed {
                index_count,
                instance_count,
                base_vertex,
                ..
            } => Some(Self::DrawIndexed {
                index_count,
                instance_count,
                base_vertex,
            }),
            GpuCommand::DrawPatches {
                patch_start,
                patch_count,
                instance_count,
                ..
            } => Some(Self::DrawPatches {
                patch_start,
                patch_count,
                instance_count,
            }),
            _ => None,
        }
    }
}

/// 已经执行完毕的 command buffer 记录
#[derive(Clone, Debug)]
pub struct ExecutedCommandBuffer {
    pub raw: RawCommandBuffer,
    pub label: String,
    pub commands: Vec<GpuCommand>,
    pub status: CommandBufferStatus,
}

struct BufferState {
    size: u64,
    placed: bool,
    contents: Vec<u8>,
}

struct TextureState {
    placed_size: Option<u64>,
    size: u64,
    contents: Vec<RasterEvent>,
}

struct HeapState {
    size: u64,
}

struct CommandBufferState {
    label: String,
    commands: Vec<GpuCommand>,
    handlers: Vec<CompletionHandler>,
    committed: bool,
}

#[derive(Default)]
struct HeadlessState {
    buffers: HashMap<RawBuffer, BufferState>,
    textures: HashMap<RawTexture, TextureState>,
    heaps: HashMap<RawHeap, HeapState>,
    fences: HashSet<RawFence>,
    signalled_fences: HashSet<RawFence>,

    command_buffers: HashMap<RawCommandBuffer, CommandBufferState>,
    pending: VecDeque<RawCommandBuffer>,
    statuses: HashMap<RawCommandBuffer, CommandBufferStatus>,
    executed: Vec<ExecutedCommandBuffer>,

    injected_error: Option<GpuErrorKind>,
    auto_complete: bool,
    fail_heap_creation: bool,
    memory_limit: Option<u64>,
    allocated_bytes: u64,

    fence_violations: Vec<String>,
    active_capture: Option<String>,
    captures: Vec<String>,
}

/// 不依赖 GPU 的软件设备
///
/// 记录所有 command buffer，在完成时按提交顺序解释执行：
/// render target 的内容用 [`RasterEvent`] 序列模拟，fence 的 wait 必须在某个已执行的 update 之后。
/// 默认提交即完成 (auto complete)，测试可以关闭后手动驱动完成。
pub struct HeadlessDevice {
    capabilities: GpuCapabilities,
    next_id: AtomicU64,
    state: Mutex<HeadlessState>,
}

// new & init
impl HeadlessDevice {
    pub fn new(capabilities: GpuCapabilities) -> Self {
        log::info!(
            "headless device: platform {:?}, features {:?}, texture budget {} MiB",
            capabilities.platform,
            capabilities.features,
            capabilities.texture_memory_budget >> 20
        );
        Self {
            capabilities,
            next_id: AtomicU64::new(1),
            state: Mutex::new(HeadlessState {
                auto_complete: true,
                ..Default::default()
            }),
        }
    }

    #[inline]
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// 测试控制
impl HeadlessDevice {
    /// 关闭后 commit 只会排队，需要 [`Self::complete_next`] / [`Self::complete_all`] 驱动执行
    pub fn set_auto_complete(&self, auto_complete: bool) {
        lock(&self.state).auto_complete = auto_complete;
    }

    /// 下一个被执行的 command buffer 以该错误结束
    pub fn inject_error(&self, kind: GpuErrorKind) {
        lock(&self.state).injected_error = Some(kind);
    }

    pub fn set_fail_heap_creation(&self, fail: bool) {
        lock(&self.state).fail_heap_creation = fail;
    }

    /// 限制 buffer / heap / 直接分配的 texture 占用的总字节数
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        lock(&self.state).memory_limit = limit;
    }

    /// 执行队首的 command buffer，没有待执行的返回 false
    pub fn complete_next(&self) -> bool {
        let (status, handlers) = {
            let mut state = lock(&self.state);
            let Some(command_buffer) = state.pending.pop_front() else {
                return false;
            };
            state.execute(command_buffer)
        };
        // 锁外调用，回调里可能会释放资源
        for handler in handlers {
            handler(status);
        }
        true
    }

    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    fn complete_through(&self, command_buffer: RawCommandBuffer) {
        while lock(&self.state).pending.contains(&command_buffer) {
            self.complete_next();
        }
    }
}

// getters
impl HeadlessDevice {
    pub fn executed_command_buffers(&self) -> Vec<ExecutedCommandBuffer> {
        lock(&self.state).executed.clone()
    }

    pub fn executed_labels(&self) -> Vec<String> {
        lock(&self.state).executed.iter().map(|cb| cb.label.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn texture_contents(&self, texture: RawTexture) -> Vec<RasterEvent> {
        lock(&self.state).textures.get(&texture).map(|t| t.contents.clone()).unwrap_or_default()
    }

    pub fn buffer_contents(&self, buffer: RawBuffer, offset: u64, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        let Some(buffer) = state.buffers.get(&buffer) else {
            return Vec::new();
        };
        (0..len as u64)
            .map(|i| buffer.contents.get((offset + i) as usize).copied().unwrap_or(0))
            .collect()
    }

    pub fn buffer_size(&self, buffer: RawBuffer) -> Option<u64> {
        lock(&self.state).buffers.get(&buffer).map(|b| b.size)
    }

    pub fn live_buffer_count(&self) -> usize {
        lock(&self.state).buffers.len()
    }

    pub fn live_texture_count(&self) -> usize {
        lock(&self.state).textures.len()
    }

    pub fn live_heap_count(&self) -> usize {
        lock(&self.state).heaps.len()
    }

    pub fn live_fence_count(&self) -> usize {
        lock(&self.state).fences.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        lock(&self.state).allocated_bytes
    }

    /// 等待了从未被 update 过的 fence 的记录
    pub fn fence_violations(&self) -> Vec<String> {
        lock(&self.state).fence_violations.clone()
    }

    pub fn captures(&self) -> Vec<String> {
        lock(&self.state).captures.clone()
    }
}

// tools
impl HeadlessState {
    fn reserve(&mut self, size: u64) -> bool {
        if let Some(limit) = self.memory_limit
            && self.allocated_bytes + size > limit
        {
            return false;
        }
        self.allocated_bytes += size;
        true
    }

    fn execute(&mut self, command_buffer: RawCommandBuffer) -> (CommandBufferStatus, Vec<CompletionHandler>) {
        let Some(record) = self.command_buffers.remove(&command_buffer) else {
            panic!("executing unknown command buffer {command_buffer:?}");
        };

        let status = match self.injected_error.take() {
            Some(kind) => CommandBufferStatus::Error(kind),
            None => {
                self.run(&record.label, &record.commands);
                CommandBufferStatus::Completed
            }
        };

        self.statuses.insert(command_buffer, status);
        self.executed.push(ExecutedCommandBuffer {
            raw: command_buffer,
            label: record.label,
            commands: record.commands,
            status,
        });
        (status, record.handlers)
    }

    fn run(&mut self, label: &str, commands: &[GpuCommand]) {
        let mut render_pass: Option<RenderPassDescriptor> = None;

        for command in commands {
            match command {
                GpuCommand::BeginRenderEncoder { descriptor, .. } => {
                    for attachment in descriptor.attachments() {
                        self.apply_load(attachment);
                    }
                    render_pass = Some(descriptor.clone());
                }
                GpuCommand::SetStoreActions(actions) => {
                    if let Some(descriptor) = render_pass.as_mut() {
                        descriptor.set_store_actions(actions);
                    }
                }
                GpuCommand::EndEncoding => {
                    if let Some(descriptor) = render_pass.take() {
                        for attachment in descriptor.attachments() {
                            self.apply_store(label, attachment);
                        }
                    }
                }
                GpuCommand::UpdateFence(fence) => {
                    self.signalled_fences.insert(*fence);
                }
                GpuCommand::WaitForFence(fence) => {
                    if !self.signalled_fences.contains(fence) {
                        let msg = format!("'{label}' waits on fence {fence:?} which no executed encoder has updated");
                        log::error!("{msg}");
                        self.fence_violations.push(msg);
                    }
                }
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => self.copy_buffer(*src, *src_offset, *dst, *dst_offset, *size),
                GpuCommand::CopyTexture { src, dst } => {
                    let contents = self.textures.get(src).map(|t| t.contents.clone()).unwrap_or_default();
                    if let Some(dst) = self.textures.get_mut(dst) {
                        dst.contents = contents;
                    }
                }
                draw if draw.is_draw() => {
                    let (Some(descriptor), Some(event)) = (render_pass.as_ref(), RasterEvent::from_command(draw)) else {
                        log::error!("'{label}': draw outside of a render encoder");
                        continue;
                    };
                    for attachment in descriptor.attachments() {
                        if let Some(texture) = self.textures.get_mut(&attachment.texture) {
                            texture.contents.push(event.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_load(&mut self, attachment: &AttachmentDesc) {
        let Some(texture) = self.textures.get_mut(&attachment.texture) else {
            return;
        };
        match attachment.load_action {
            LoadAction::Load => {}
            LoadAction::Clear => texture.contents = vec![RasterEvent::Clear(attachment.clear_value)],
            LoadAction::DontCare => texture.contents.clear(),
        }
    }

    fn apply_store(&mut self, label: &str, attachment: &AttachmentDesc) {
        let contents = self.textures.get(&attachment.texture).map(|t| t.contents.clone()).unwrap_or_default();

        if attachment.store_action.resolves() {
            match attachment.resolve_texture.and_then(|raw| self.textures.get_mut(&raw)) {
                Some(resolve) => resolve.contents = contents,
                None => log::error!("'{label}': resolve store action without a resolve texture"),
            }
        }

        let keep = match attachment.store_action {
            StoreAction::Unknown => {
                log::error!("'{label}': store action of {:?} was never set before end of encoding", attachment.texture);
                false
            }
            action => action.keeps_contents(),
        };
        if !keep && let Some(texture) = self.textures.get_mut(&attachment.texture) {
            texture.contents.clear();
        }
    }

    fn copy_buffer(&mut self, src: RawBuffer, src_offset: u64, dst: RawBuffer, dst_offset: u64, size: u64) {
        let bytes: Vec<u8> = match self.buffers.get(&src) {
            Some(src) => (src_offset..src_offset + size)
                .map(|i| src.contents.get(i as usize).copied().unwrap_or(0))
                .collect(),
            None => return,
        };
        if let Some(dst) = self.buffers.get_mut(&dst) {
            write_bytes(dst, dst_offset, &bytes);
        }
    }
}

fn write_bytes(buffer: &mut BufferState, offset: u64, data: &[u8]) {
    assert!(
        offset + data.len() as u64 <= buffer.size,
        "write of {} bytes at {offset} overflows buffer of {} bytes",
        data.len(),
        buffer.size
    );
    let end = (offset as usize) + data.len();
    if buffer.contents.len() < end {
        buffer.contents.resize(end, 0);
    }
    buffer.contents[offset as usize..end].copy_from_slice(data);
}

impl GpuDevice for HeadlessDevice {
    fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn new_buffer(&self, size: u64, _options: ResourceOptions) -> Option<RawBuffer> {
        let mut state = lock(&self.state);
        if !state.reserve(size) {
            return None;
        }
        let raw = RawBuffer(self.next_id());
        state.buffers.insert(
            raw,
            BufferState {
                size,
                placed: false,
                contents: Vec::new(),
            },
        );
        Some(raw)
    }

    fn new_texture(&self, desc: &TextureDesc) -> Option<RawTexture> {
        let size = self.texture_size_and_align(desc).size;
        let mut state = lock(&self.state);
        if !state.reserve(size) {
            return None;
        }
        let raw = RawTexture(self.next_id());
        state.textures.insert(
            raw,
            TextureState {
                placed_size: None,
                size,
                contents: Vec::new(),
            },
        );
        Some(raw)
    }

    fn texture_size_and_align(&self, desc: &TextureDesc) -> SizeAndAlign {
        let align = if desc.usage.contains(TextureUsage::RENDER_TARGET) || desc.sample_count > 1 {
            64 * 1024
        } else {
            4 * 1024
        };
        SizeAndAlign {
            size: align_up(desc.unaligned_size().max(1), align),
            align,
        }
    }

    fn release_buffer(&self, buffer: RawBuffer) {
        let mut state = lock(&self.state);
        match state.buffers.remove(&buffer) {
            Some(b) if !b.placed => state.allocated_bytes -= b.size,
            Some(_) => {}
            None => panic!("release of unknown buffer {buffer:?}"),
        }
    }

    fn release_texture(&self, texture: RawTexture) {
        let mut state = lock(&self.state);
        match state.textures.remove(&texture) {
            Some(t) if t.placed_size.is_none() => state.allocated_bytes -= t.size,
            Some(_) => {}
            None => panic!("release of unknown texture {texture:?}"),
        }
    }

    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]) {
        let mut state = lock(&self.state);
        let Some(buffer) = state.buffers.get_mut(&buffer) else {
            panic!("write to unknown buffer {buffer:?}");
        };
        write_bytes(buffer, offset, data);
    }

    fn new_heap(&self, size: u64, _options: ResourceOptions) -> Option<RawHeap> {
        if !self.capabilities.supports(GpuFeatures::HEAPS) {
            return None;
        }
        let mut state = lock(&self.state);
        if state.fail_heap_creation || !state.reserve(size) {
            return None;
        }
        let raw = RawHeap(self.next_id());
        state.heaps.insert(raw, HeapState { size });
        Some(raw)
    }

    fn new_placed_buffer(&self, heap: RawHeap, offset: u64, size: u64, _options: ResourceOptions) -> Option<RawBuffer> {
        let mut state = lock(&self.state);
        let heap_size = state.heaps.get(&heap)?.size;
        if offset + size > heap_size {
            log::error!("placed buffer [{offset}, {}) exceeds heap {heap:?} of {heap_size} bytes", offset + size);
            return None;
        }
        let raw = RawBuffer(self.next_id());
        state.buffers.insert(
            raw,
            BufferState {
                size,
                placed: true,
                contents: Vec::new(),
            },
        );
        Some(raw)
    }

    fn new_placed_texture(&self, heap: RawHeap, offset: u64, desc: &TextureDesc) -> Option<RawTexture> {
        let size = self.texture_size_and_align(desc).size;
        let mut state = lock(&self.state);
        let heap_size = state.heaps.get(&heap)?.size;
        if offset + size > heap_size {
            log::error!("placed texture [{offset}, {}) exceeds heap {heap:?} of {heap_size} bytes", offset + size);
            return None;
        }
        let raw = RawTexture(self.next_id());
        state.textures.insert(
            raw,
            TextureState {
                placed_size: Some(size),
                size,
                contents: Vec::new(),
            },
        );
        Some(raw)
    }

    fn release_heap(&self, heap: RawHeap) {
        let mut state = lock(&self.state);
        let Some(heap_state) = state.heaps.remove(&heap) else {
            panic!("release of unknown heap {heap:?}");
        };
        state.allocated_bytes -= heap_state.size;
    }

    fn new_fence(&self, _label: &str) -> Option<RawFence> {
        if !self.capabilities.supports(GpuFeatures::FENCES) {
            return None;
        }
        let raw = RawFence(self.next_id());
        lock(&self.state).fences.insert(raw);
        Some(raw)
    }

    fn release_fence(&self, fence: RawFence) {
        let mut state = lock(&self.state);
        assert!(state.fences.remove(&fence), "release of unknown fence {fence:?}");
        state.signalled_fences.remove(&fence);
    }

    fn new_command_buffer(&self, label: &str) -> RawCommandBuffer {
        let raw = RawCommandBuffer(self.next_id());
        lock(&self.state).command_buffers.insert(
            raw,
            CommandBufferState {
                label: label.to_string(),
                commands: Vec::new(),
                handlers: Vec::new(),
                committed: false,
            },
        );
        raw
    }

    fn encode(&self, command_buffer: RawCommandBuffer, command: GpuCommand) {
        let mut state = lock(&self.state);
        let Some(record) = state.command_buffers.get_mut(&command_buffer) else {
            panic!("encode into unknown command buffer {command_buffer:?}");
        };
        assert!(!record.committed, "encode into committed command buffer '{}'", record.label);
        record.commands.push(command);
    }

    fn commit(&self, command_buffer: RawCommandBuffer, handlers: Vec<CompletionHandler>) {
        let _span = tracy_client::span!("HeadlessDevice::commit");
        let auto_complete = {
            let mut state = lock(&self.state);
            let Some(record) = state.command_buffers.get_mut(&command_buffer) else {
                panic!("commit of unknown command buffer {command_buffer:?}");
            };
            assert!(!record.committed, "command buffer '{}' committed twice", record.label);
            record.committed = true;
            record.handlers = handlers;
            state.pending.push_back(command_buffer);
            state.auto_complete
        };
        if auto_complete {
            self.complete_through(command_buffer);
        }
    }

    fn wait_until_completed(&self, command_buffer: RawCommandBuffer) -> CommandBufferStatus {
        self.complete_through(command_buffer);
        let status = lock(&self.state).statuses.get(&command_buffer).copied();
        status.unwrap_or_else(|| panic!("wait on command buffer {command_buffer:?} which was never committed"))
    }

    fn begin_capture_scope(&self, label: &str) {
        let mut state = lock(&self.state);
        if let Some(active) = &state.active_capture {
            log::warn!("capture scope '{label}' ignored, '{active}' is still active");
            return;
        }
        state.active_capture = Some(label.to_string());
    }

    fn end_capture_scope(&self) {
        let mut state = lock(&self.state);
        if let Some(label) = state.active_capture.take() {
            state.captures.push(label);
        }
    }
}
