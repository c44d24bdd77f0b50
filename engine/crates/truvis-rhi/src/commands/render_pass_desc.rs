use crate::foundation::device::{RawBuffer, RawTexture};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadAction {
    DontCare,
    Load,
    Clear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreAction {
    /// 延迟到 encoder 结束前才确定
    Unknown,
    DontCare,
    Store,
    MultisampleResolve,
    StoreAndMultisampleResolve,
}

impl StoreAction {
    #[inline]
    pub fn resolves(self) -> bool {
        matches!(self, Self::MultisampleResolve | Self::StoreAndMultisampleResolve)
    }

    #[inline]
    pub fn keeps_contents(self) -> bool {
        matches!(self, Self::Store | Self::StoreAndMultisampleResolve)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
    Stencil(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentDesc {
    pub texture: RawTexture,
    pub resolve_texture: Option<RawTexture>,
    pub load_action: LoadAction,
    pub store_action: StoreAction,
    pub clear_value: ClearValue,
}

impl AttachmentDesc {
    pub fn new(texture: RawTexture, clear_value: ClearValue) -> Self {
        Self {
            texture,
            resolve_texture: None,
            load_action: LoadAction::Clear,
            store_action: StoreAction::Store,
            clear_value,
        }
    }
}

/// 底层的 render pass 描述，对应一次 render encoder 的全部附件
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderPassDescriptor {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
    pub stencil_attachment: Option<AttachmentDesc>,
    pub visibility_buffer: Option<RawBuffer>,
}

/// encoder 结束前设置的真实 store action，顺序与 [`RenderPassDescriptor`] 中的附件一致
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreActions {
    pub color: Vec<StoreAction>,
    pub depth: Option<StoreAction>,
    pub stencil: Option<StoreAction>,
}

// tools
impl RenderPassDescriptor {
    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentDesc> {
        self.color_attachments.iter().chain(self.depth_attachment.iter()).chain(self.stencil_attachment.iter())
    }

    fn attachments_mut(&mut self) -> impl Iterator<Item = &mut AttachmentDesc> {
        self.color_attachments
            .iter_mut()
            .chain(self.depth_attachment.iter_mut())
            .chain(self.stencil_attachment.iter_mut())
    }

    #[inline]
    pub fn has_clear_load_action(&self) -> bool {
        self.attachments().any(|a| a.load_action == LoadAction::Clear)
    }

    #[inline]
    pub fn has_resolve_store_action(&self) -> bool {
        self.attachments().any(|a| a.store_action.resolves())
    }

    /// 所有附件的 load action 改写为 Load，用于在同一组 render target 上重启 encoder
    pub fn rewrite_loads_to_load(&mut self) {
        for attachment in self.attachments_mut() {
            attachment.load_action = LoadAction::Load;
        }
    }

    /// 只把 Clear 改写为 Load
    pub fn rewrite_clears_to_load(&mut self) {
        for attachment in self.attachments_mut() {
            if attachment.load_action == LoadAction::Clear {
                attachment.load_action = LoadAction::Load;
            }
        }
    }

    pub fn set_store_actions(&mut self, actions: &StoreActions) {
        for (attachment, action) in self.color_attachments.iter_mut().zip(&actions.color) {
            attachment.store_action = *action;
        }
        if let (Some(depth), Some(action)) = (self.depth_attachment.as_mut(), actions.depth) {
            depth.store_action = action;
        }
        if let (Some(stencil), Some(action)) = (self.stencil_attachment.as_mut(), actions.stencil) {
            stencil.store_action = action;
        }
    }

    pub fn store_actions(&self) -> StoreActions {
        StoreActions {
            color: self.color_attachments.iter().map(|a| a.store_action).collect(),
            depth: self.depth_attachment.as_ref().map(|a| a.store_action),
            stencil: self.stencil_attachment.as_ref().map(|a| a.store_action),
        }
    }
}
