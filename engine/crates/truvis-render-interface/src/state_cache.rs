use std::collections::BTreeMap;

use bitflags::bitflags;
use truvis_rhi::commands::command_encoder::CommandEncoder;
use truvis_rhi::commands::gpu_command::{PipelineHandle, SamplerHandle, ScissorRect, ShaderStage, Viewport};
use truvis_rhi::commands::render_pass_desc::{
    AttachmentDesc, ClearValue, LoadAction, RenderPassDescriptor, StoreAction, StoreActions,
};
use truvis_rhi::foundation::capabilities::{GpuCapabilities, GpuFeatures};
use truvis_rhi::foundation::device::{RawBuffer, RawTexture};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtLoadAction {
    DontCare,
    Load,
    Clear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtStoreAction {
    DontCare,
    Store,
    /// 只保留 resolve 的结果，多重采样的 texture 本身可以丢弃
    MultisampleResolve,
}

impl From<RtLoadAction> for LoadAction {
    fn from(action: RtLoadAction) -> Self {
        match action {
            RtLoadAction::DontCare => Self::DontCare,
            RtLoadAction::Load => Self::Load,
            RtLoadAction::Clear => Self::Clear,
        }
    }
}

impl From<RtStoreAction> for StoreAction {
    fn from(action: RtStoreAction) -> Self {
        match action {
            RtStoreAction::DontCare => Self::DontCare,
            RtStoreAction::Store => Self::Store,
            RtStoreAction::MultisampleResolve => Self::MultisampleResolve,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColorTarget {
    pub texture: RawTexture,
    pub resolve_texture: Option<RawTexture>,
    pub sample_count: u32,
    pub load_action: RtLoadAction,
    pub store_action: RtStoreAction,
    pub clear_color: [f32; 4],
}

impl ColorTarget {
    pub fn new(texture: RawTexture) -> Self {
        Self {
            texture,
            resolve_texture: None,
            sample_count: 1,
            load_action: RtLoadAction::Clear,
            store_action: RtStoreAction::Store,
            clear_color: [0.0; 4],
        }
    }

    pub fn with_load(mut self, load_action: RtLoadAction) -> Self {
        self.load_action = load_action;
        self
    }

    pub fn with_store(mut self, store_action: RtStoreAction) -> Self {
        self.store_action = store_action;
        self
    }

    pub fn with_clear(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// 多重采样并 resolve 到 `resolve_texture`
    pub fn with_msaa(mut self, sample_count: u32, resolve_texture: RawTexture) -> Self {
        self.sample_count = sample_count;
        self.resolve_texture = Some(resolve_texture);
        self.store_action = RtStoreAction::MultisampleResolve;
        self
    }

    #[inline]
    fn is_multisampled(&self) -> bool {
        self.sample_count > 1 && self.resolve_texture.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DepthStencilTarget {
    pub texture: RawTexture,
    pub resolve_texture: Option<RawTexture>,
    pub sample_count: u32,
    pub depth_load: RtLoadAction,
    pub depth_store: RtStoreAction,
    /// None 表示该格式没有 stencil
    pub stencil: Option<(RtLoadAction, RtStoreAction)>,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthStencilTarget {
    pub fn new(texture: RawTexture) -> Self {
        Self {
            texture,
            resolve_texture: None,
            sample_count: 1,
            depth_load: RtLoadAction::Clear,
            depth_store: RtStoreAction::Store,
            stencil: None,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    pub fn with_stencil(mut self, load: RtLoadAction, store: RtStoreAction) -> Self {
        self.stencil = Some((load, store));
        self
    }

    #[inline]
    fn is_multisampled(&self) -> bool {
        self.sample_count > 1 && self.resolve_texture.is_some()
    }
}

/// 上层描述的 render target 组合
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderTargetsInfo {
    pub colors: Vec<ColorTarget>,
    pub depth_stencil: Option<DepthStencilTarget>,
    pub visibility_buffer: Option<RawBuffer>,
}

impl RenderTargetsInfo {
    fn load_actions(&self) -> impl Iterator<Item = RtLoadAction> + '_ {
        self.colors
            .iter()
            .map(|c| c.load_action)
            .chain(self.depth_stencil.iter().flat_map(|ds| std::iter::once(ds.depth_load).chain(ds.stencil.map(|s| s.0))))
    }

    fn store_actions(&self) -> impl Iterator<Item = RtStoreAction> + '_ {
        self.colors
            .iter()
            .map(|c| c.store_action)
            .chain(self.depth_stencil.iter().flat_map(|ds| std::iter::once(ds.depth_store).chain(ds.stencil.map(|s| s.1))))
    }

    fn max_sample_count(&self) -> u32 {
        self.colors
            .iter()
            .map(|c| c.sample_count)
            .chain(self.depth_stencil.iter().map(|ds| ds.sample_count))
            .max()
            .unwrap_or(1)
    }

    /// `all` 为 false 时只改写 Clear
    fn rewrite_loads_to_load(&mut self, all: bool) {
        let rewrite = |action: &mut RtLoadAction| {
            if all || *action == RtLoadAction::Clear {
                *action = RtLoadAction::Load;
            }
        };
        for color in &mut self.colors {
            rewrite(&mut color.load_action);
        }
        if let Some(ds) = self.depth_stencil.as_mut() {
            rewrite(&mut ds.depth_load);
            if let Some((load, _)) = ds.stencil.as_mut() {
                rewrite(load);
            }
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DirtyState: u32 {
        const RENDER_PIPELINE = 1 << 0;
        const COMPUTE_PIPELINE = 1 << 1;
        const VIEWPORT = 1 << 2;
        const SCISSOR = 1 << 3;
        const VERTEX_RESOURCES = 1 << 4;
        const FRAGMENT_RESOURCES = 1 << 5;
        const COMPUTE_RESOURCES = 1 << 6;
    }
}

impl DirtyState {
    #[inline]
    fn resources(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::VERTEX_RESOURCES,
            ShaderStage::Fragment => Self::FRAGMENT_RESOURCES,
            ShaderStage::Compute => Self::COMPUTE_RESOURCES,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct StageResources {
    buffers: BTreeMap<u32, (RawBuffer, u64)>,
    bytes: BTreeMap<u32, Vec<u8>>,
    textures: BTreeMap<u32, RawTexture>,
    samplers: BTreeMap<u32, SamplerHandle>,
}

/// draw / dispatch 共享的状态
///
/// 上层只和这里打交道，真正写入 encoder 发生在 `commit_*_state`，
/// 每次新 encoder 开始后调用 [`StateCache::invalidate`] 让所有状态重新提交。
pub struct StateCache {
    deferred_store_actions: bool,

    render_targets: Option<RenderTargetsInfo>,
    descriptor: Option<RenderPassDescriptor>,
    render_targets_active: bool,

    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    render_pipeline: Option<PipelineHandle>,
    compute_pipeline: Option<PipelineHandle>,
    resources: [StageResources; ShaderStage::COUNT],

    dirty: DirtyState,
}

// new & init
impl StateCache {
    pub fn new(capabilities: &GpuCapabilities) -> Self {
        Self {
            deferred_store_actions: capabilities.supports(GpuFeatures::DEFERRED_STORE_ACTIONS),
            render_targets: None,
            descriptor: None,
            render_targets_active: false,
            viewport: None,
            scissor: None,
            render_pipeline: None,
            compute_pipeline: None,
            resources: Default::default(),
            dirty: DirtyState::all(),
        }
    }
}

// getters
impl StateCache {
    #[inline]
    pub fn render_targets(&self) -> Option<&RenderTargetsInfo> {
        self.render_targets.as_ref()
    }

    #[inline]
    pub fn render_pass_descriptor(&self) -> Option<&RenderPassDescriptor> {
        self.descriptor.as_ref()
    }

    #[inline]
    pub fn render_targets_active(&self) -> bool {
        self.render_targets_active
    }

    #[inline]
    pub fn uses_deferred_store_actions(&self) -> bool {
        self.deferred_store_actions
    }

    #[inline]
    pub fn dirty(&self) -> DirtyState {
        self.dirty
    }

    /// 能否在同一组 render target 上重新开始 render encoder 而不丢失内容
    pub fn can_restart_render_pass(&self) -> bool {
        let Some(targets) = self.render_targets.as_ref() else {
            return false;
        };
        // 有延迟 store action 时中途打断一律 Store，最终的 store action 不影响重启
        targets.max_sample_count() <= 1
            && targets.load_actions().all(|a| a != RtLoadAction::Clear)
            && (self.deferred_store_actions || targets.store_actions().all(|a| a == RtStoreAction::Store))
    }

    /// 是否有多重采样 resolve，resolve 不能被拆到两个 command buffer 中
    pub fn has_pending_resolve(&self) -> bool {
        self.render_targets.as_ref().is_some_and(|targets| {
            targets.colors.iter().any(ColorTarget::is_multisampled)
                || targets.depth_stencil.as_ref().is_some_and(DepthStencilTarget::is_multisampled)
        })
    }
}

// render targets
impl StateCache {
    /// 设置新的 render target 组合并生成底层 descriptor
    ///
    /// 支持延迟 store action 时 descriptor 中的 store 全部为 `Unknown`，在 encoder 结束前再确定
    pub fn set_render_targets(&mut self, targets: RenderTargetsInfo) {
        assert!(!self.render_targets_active, "render targets changed while the render pass is active");
        self.descriptor = Some(self.build_descriptor(&targets));
        self.render_targets = Some(targets);
    }

    fn build_descriptor(&self, targets: &RenderTargetsInfo) -> RenderPassDescriptor {
        let store = |action: RtStoreAction| {
            if self.deferred_store_actions { StoreAction::Unknown } else { action.into() }
        };

        let color_attachments = targets
            .colors
            .iter()
            .map(|color| AttachmentDesc {
                texture: color.texture,
                resolve_texture: color.resolve_texture,
                load_action: color.load_action.into(),
                store_action: store(color.store_action),
                clear_value: ClearValue::Color(color.clear_color),
            })
            .collect();
        let depth_attachment = targets.depth_stencil.as_ref().map(|ds| AttachmentDesc {
            texture: ds.texture,
            resolve_texture: ds.resolve_texture,
            load_action: ds.depth_load.into(),
            store_action: store(ds.depth_store),
            clear_value: ClearValue::Depth(ds.clear_depth),
        });
        let stencil_attachment = targets.depth_stencil.as_ref().and_then(|ds| {
            ds.stencil.map(|(load, st)| AttachmentDesc {
                texture: ds.texture,
                resolve_texture: None,
                load_action: load.into(),
                store_action: store(st),
                clear_value: ClearValue::Stencil(ds.clear_stencil),
            })
        });

        RenderPassDescriptor {
            color_attachments,
            depth_attachment,
            stencil_attachment,
            visibility_buffer: targets.visibility_buffer,
        }
    }

    /// render pass 开始后 clear 已经发生，之后的重启都改为 Load
    pub fn set_render_targets_active(&mut self, active: bool) {
        self.render_targets_active = active;
        if !active {
            return;
        }
        let Some(targets) = self.render_targets.as_mut() else {
            return;
        };
        // 单采样时之后的重启都从已有内容继续
        let single_sampled = targets.max_sample_count() <= 1;
        targets.rewrite_loads_to_load(single_sampled);
        if let Some(descriptor) = self.descriptor.as_mut() {
            if single_sampled {
                descriptor.rewrite_loads_to_load();
            } else {
                descriptor.rewrite_clears_to_load();
            }
        }
    }

    /// render encoder 结束时的真实 store action
    ///
    /// `mid_pass` 表示 encoder 在 render pass 中途被打断（切换 encoder 或提前提交），
    /// 此时内容必须保留：颜色和深度为 Store，多重采样的附件同时 resolve，stencil 为 Store
    pub fn store_actions(&self, mid_pass: bool) -> StoreActions {
        let Some(targets) = self.render_targets.as_ref() else {
            return StoreActions::default();
        };

        let interrupted = |multisampled: bool| {
            if multisampled { StoreAction::StoreAndMultisampleResolve } else { StoreAction::Store }
        };

        if mid_pass {
            StoreActions {
                color: targets.colors.iter().map(|c| interrupted(c.is_multisampled())).collect(),
                depth: targets.depth_stencil.as_ref().map(|ds| interrupted(ds.is_multisampled())),
                stencil: targets.depth_stencil.as_ref().and_then(|ds| ds.stencil.map(|_| StoreAction::Store)),
            }
        } else {
            StoreActions {
                color: targets.colors.iter().map(|c| c.store_action.into()).collect(),
                depth: targets.depth_stencil.as_ref().map(|ds| ds.depth_store.into()),
                stencil: targets.depth_stencil.as_ref().and_then(|ds| ds.stencil.map(|(_, st)| st.into())),
            }
        }
    }
}

// 绘制状态
impl StateCache {
    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != Some(viewport) {
            self.viewport = Some(viewport);
            self.dirty |= DirtyState::VIEWPORT;
        }
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        if self.scissor != Some(rect) {
            self.scissor = Some(rect);
            self.dirty |= DirtyState::SCISSOR;
        }
    }

    pub fn set_render_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.render_pipeline != Some(pipeline) {
            self.render_pipeline = Some(pipeline);
            self.dirty |= DirtyState::RENDER_PIPELINE;
        }
    }

    pub fn set_compute_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.compute_pipeline != Some(pipeline) {
            self.compute_pipeline = Some(pipeline);
            self.dirty |= DirtyState::COMPUTE_PIPELINE;
        }
    }

    pub fn set_shader_buffer(&mut self, stage: ShaderStage, index: u32, buffer: RawBuffer, offset: u64) {
        let resources = &mut self.resources[stage.index()];
        resources.bytes.remove(&index);
        if resources.buffers.insert(index, (buffer, offset)) != Some((buffer, offset)) {
            self.dirty |= DirtyState::resources(stage);
        }
    }

    /// 小块常量数据，提交时写入 encoder 的 ring buffer
    pub fn set_shader_bytes(&mut self, stage: ShaderStage, index: u32, bytes: &[u8]) {
        let resources = &mut self.resources[stage.index()];
        resources.buffers.remove(&index);
        resources.bytes.insert(index, bytes.to_vec());
        self.dirty |= DirtyState::resources(stage);
    }

    pub fn set_shader_texture(&mut self, stage: ShaderStage, index: u32, texture: RawTexture) {
        if self.resources[stage.index()].textures.insert(index, texture) != Some(texture) {
            self.dirty |= DirtyState::resources(stage);
        }
    }

    pub fn set_shader_sampler(&mut self, stage: ShaderStage, index: u32, sampler: SamplerHandle) {
        if self.resources[stage.index()].samplers.insert(index, sampler) != Some(sampler) {
            self.dirty |= DirtyState::resources(stage);
        }
    }

    /// 新的 encoder 没有任何状态，全部标记为 dirty
    #[inline]
    pub fn invalidate(&mut self) {
        self.dirty = DirtyState::all();
    }

    /// 清空全部状态，用于帧结束或 context 被回收
    pub fn reset(&mut self) {
        self.render_targets = None;
        self.descriptor = None;
        self.render_targets_active = false;
        self.viewport = None;
        self.scissor = None;
        self.render_pipeline = None;
        self.compute_pipeline = None;
        self.resources = Default::default();
        self.dirty = DirtyState::all();
    }
}

// commit
impl StateCache {
    pub fn commit_render_state(&mut self, encoder: &mut CommandEncoder) {
        let _span = tracy_client::span!("StateCache::commit_render_state");
        assert!(encoder.is_render_active(), "commit render state without a render encoder");

        if self.dirty.contains(DirtyState::RENDER_PIPELINE)
            && let Some(pipeline) = self.render_pipeline
        {
            encoder.set_render_pipeline(pipeline);
        }
        if self.dirty.contains(DirtyState::VIEWPORT)
            && let Some(viewport) = self.viewport
        {
            encoder.set_viewport(viewport);
        }
        if self.dirty.contains(DirtyState::SCISSOR)
            && let Some(rect) = self.scissor
        {
            encoder.set_scissor_rect(rect);
        }
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            if self.dirty.contains(DirtyState::resources(stage)) {
                self.commit_resources(stage, encoder);
            }
        }
        self.dirty -= DirtyState::RENDER_PIPELINE
            | DirtyState::VIEWPORT
            | DirtyState::SCISSOR
            | DirtyState::VERTEX_RESOURCES
            | DirtyState::FRAGMENT_RESOURCES;
    }

    pub fn commit_compute_state(&mut self, encoder: &mut CommandEncoder) {
        let _span = tracy_client::span!("StateCache::commit_compute_state");
        assert!(encoder.is_compute_active(), "commit compute state without a compute encoder");

        if self.dirty.contains(DirtyState::COMPUTE_PIPELINE)
            && let Some(pipeline) = self.compute_pipeline
        {
            encoder.set_compute_pipeline(pipeline);
        }
        if self.dirty.contains(DirtyState::COMPUTE_RESOURCES) {
            self.commit_resources(ShaderStage::Compute, encoder);
        }
        self.dirty -= DirtyState::COMPUTE_PIPELINE | DirtyState::COMPUTE_RESOURCES;
    }

    fn commit_resources(&self, stage: ShaderStage, encoder: &mut CommandEncoder) {
        let resources = &self.resources[stage.index()];
        for (&index, &(buffer, offset)) in &resources.buffers {
            encoder.set_shader_buffer(stage, index, buffer, offset);
        }
        for (&index, bytes) in &resources.bytes {
            encoder.set_shader_bytes(stage, index, bytes);
        }
        for (&index, &texture) in &resources.textures {
            encoder.set_shader_texture(stage, index, texture);
        }
        for (&index, &sampler) in &resources.samplers {
            encoder.set_shader_sampler(stage, index, sampler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use truvis_rhi::foundation::capabilities::PlatformClass;

    fn targets() -> RenderTargetsInfo {
        RenderTargetsInfo {
            colors: vec![ColorTarget::new(RawTexture(1)).with_clear([0.1, 0.2, 0.3, 1.0])],
            depth_stencil: Some(
                DepthStencilTarget::new(RawTexture(2)).with_stencil(RtLoadAction::Clear, RtStoreAction::DontCare),
            ),
            visibility_buffer: None,
        }
    }

    fn targets_with_msaa() -> RenderTargetsInfo {
        RenderTargetsInfo {
            colors: vec![ColorTarget::new(RawTexture(5)).with_msaa(4, RawTexture(6))],
            depth_stencil: None,
            visibility_buffer: None,
        }
    }

    #[test]
    fn test_descriptor_defers_store_actions() {
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        cache.set_render_targets(targets());
        let descriptor = cache.render_pass_descriptor().unwrap();
        assert!(descriptor.attachments().all(|a| a.store_action == StoreAction::Unknown));
        assert!(descriptor.has_clear_load_action());

        let mut cache = StateCache::new(&GpuCapabilities::minimal(PlatformClass::Desktop));
        cache.set_render_targets(targets());
        let descriptor = cache.render_pass_descriptor().unwrap();
        assert_eq!(descriptor.color_attachments[0].store_action, StoreAction::Store);
        assert_eq!(descriptor.stencil_attachment.as_ref().unwrap().store_action, StoreAction::DontCare);
    }

    #[test]
    fn test_activation_rewrites_clears_and_enables_restart() {
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        let mut info = targets();
        info.depth_stencil = Some(DepthStencilTarget::new(RawTexture(2)));
        cache.set_render_targets(info);
        assert!(!cache.can_restart_render_pass());

        cache.set_render_targets_active(true);
        assert!(!cache.render_pass_descriptor().unwrap().has_clear_load_action());
        assert!(cache.can_restart_render_pass());
        assert!(!cache.has_pending_resolve());
    }

    #[test]
    fn test_restart_depends_on_deferred_stores() {
        // targets() 的 stencil 是 Clear / DontCare
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        cache.set_render_targets(targets());
        cache.set_render_targets_active(true);
        assert!(cache.can_restart_render_pass());

        let mut cache = StateCache::new(&GpuCapabilities::minimal(PlatformClass::Desktop));
        cache.set_render_targets(targets());
        cache.set_render_targets_active(true);
        assert!(!cache.can_restart_render_pass());
    }

    #[test]
    fn test_activation_rewrites_every_load_when_single_sampled() {
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        let mut info = targets();
        info.colors.push(ColorTarget::new(RawTexture(3)).with_load(RtLoadAction::DontCare));
        cache.set_render_targets(info);
        cache.set_render_targets_active(true);

        let descriptor = cache.render_pass_descriptor().unwrap();
        assert!(descriptor.attachments().all(|a| a.load_action == LoadAction::Load));
        let targets = cache.render_targets().unwrap();
        assert_eq!(targets.colors[1].load_action, RtLoadAction::Load);

        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        let mut info = targets_with_msaa();
        info.colors[0].load_action = RtLoadAction::DontCare;
        cache.set_render_targets(info);
        cache.set_render_targets_active(true);
        assert_eq!(cache.render_targets().unwrap().colors[0].load_action, RtLoadAction::DontCare);
        assert!(!cache.can_restart_render_pass());
    }

    #[test]
    fn test_mid_pass_store_actions() {
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        let mut info = targets();
        info.colors.push(ColorTarget::new(RawTexture(3)).with_msaa(4, RawTexture(4)));
        cache.set_render_targets(info);
        assert!(cache.has_pending_resolve());

        let interrupted = cache.store_actions(true);
        assert_eq!(interrupted.color, vec![StoreAction::Store, StoreAction::StoreAndMultisampleResolve]);
        assert_eq!(interrupted.depth, Some(StoreAction::Store));
        assert_eq!(interrupted.stencil, Some(StoreAction::Store));

        let finished = cache.store_actions(false);
        assert_eq!(finished.color, vec![StoreAction::Store, StoreAction::MultisampleResolve]);
        assert_eq!(finished.stencil, Some(StoreAction::DontCare));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut cache = StateCache::new(&GpuCapabilities::desktop());
        cache.dirty = DirtyState::empty();
        cache.set_render_pipeline(PipelineHandle(1));
        cache.set_shader_texture(ShaderStage::Fragment, 0, RawTexture(9));
        assert_eq!(cache.dirty(), DirtyState::RENDER_PIPELINE | DirtyState::FRAGMENT_RESOURCES);

        cache.dirty = DirtyState::empty();
        cache.set_render_pipeline(PipelineHandle(1));
        cache.set_shader_texture(ShaderStage::Fragment, 0, RawTexture(9));
        assert!(cache.dirty().is_empty());

        cache.invalidate();
        assert_eq!(cache.dirty(), DirtyState::all());
    }
}
