use std::sync::Arc;

use crate::commands::fence::Fence;
use crate::commands::gpu_command::GpuCommand;
use crate::foundation::device::{CompletionHandler, GpuDevice, RawCommandBuffer};
use crate::foundation::gpu_error::CommandBufferStatus;
use crate::settings::CommandDebugLevel;

/// 对设备 command buffer 的独占包装
///
/// 记录 label、debug group 以及提交时需要挂上的 completion handler。
/// debug 级别在 `Logging` 及以上时额外记录 debug group 的历史，GPU 出错时用于定位。
pub struct CommandBuffer {
    raw: RawCommandBuffer,
    label: String,
    device: Arc<dyn GpuDevice>,
    debug_level: CommandDebugLevel,

    debug_group_stack: Vec<String>,
    /// 录制过程中出现过的全部 debug group，失败时用于定位
    debug_group_history: Vec<String>,
    completion_handlers: Vec<CompletionHandler>,
    /// 命令流中引用的 fence，保持存活直到 GPU 执行完毕
    retained_fences: Vec<Fence>,
}

// new & init
impl CommandBuffer {
    pub fn new(device: Arc<dyn GpuDevice>, label: impl Into<String>) -> Self {
        let label = label.into();
        let raw = device.new_command_buffer(&label);
        Self {
            raw,
            label,
            device,
            debug_level: CommandDebugLevel::Off,
            debug_group_stack: Vec::new(),
            debug_group_history: Vec::new(),
            completion_handlers: Vec::new(),
            retained_fences: Vec::new(),
        }
    }

    #[inline]
    pub fn with_debug_level(mut self, debug_level: CommandDebugLevel) -> Self {
        self.debug_level = debug_level;
        self
    }
}

// getters
impl CommandBuffer {
    #[inline]
    pub fn raw(&self) -> RawCommandBuffer {
        self.raw
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn debug_level(&self) -> CommandDebugLevel {
        self.debug_level
    }

    #[inline]
    pub fn debug_group_stack(&self) -> &[String] {
        &self.debug_group_stack
    }

    #[inline]
    pub fn debug_groups(&self) -> &[String] {
        &self.debug_group_history
    }
}

// tools
impl CommandBuffer {
    #[inline]
    pub fn encode(&self, command: GpuCommand) {
        self.device.encode(self.raw, command);
    }

    pub fn push_debug_group(&mut self, name: &str) {
        self.encode(GpuCommand::PushDebugGroup(name.to_string()));
        self.debug_group_stack.push(name.to_string());
        if self.debug_level >= CommandDebugLevel::Logging {
            self.debug_group_history.push(self.debug_group_stack.join("/"));
        }
    }

    pub fn pop_debug_group(&mut self) {
        assert!(self.debug_group_stack.pop().is_some(), "'{}': pop_debug_group without push", self.label);
        self.encode(GpuCommand::PopDebugGroup);
    }

    pub fn add_completion_handler(&mut self, handler: impl FnOnce(CommandBufferStatus) + Send + 'static) {
        self.completion_handlers.push(Box::new(handler));
    }

    pub fn retain_fence(&mut self, fence: &Fence) {
        if !self.retained_fences.iter().any(|f| f.same(fence)) {
            self.retained_fences.push(fence.clone());
        }
    }

    /// 取出已注册的 completion handler，提交时交给设备
    ///
    /// 被引用的 fence 由最后一个 handler 持有，GPU 完成后才释放
    pub fn take_completion_handlers(&mut self) -> Vec<CompletionHandler> {
        let mut handlers = std::mem::take(&mut self.completion_handlers);
        let retained = std::mem::take(&mut self.retained_fences);
        if !retained.is_empty() {
            handlers.push(Box::new(move |_: CommandBufferStatus| drop(retained)));
        }
        handlers
    }
}
