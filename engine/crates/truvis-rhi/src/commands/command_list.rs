use std::sync::Arc;

use crate::commands::command_buffer::CommandBuffer;
use crate::commands::command_queue::CommandQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListKind {
    /// 直接提交到队列
    Immediate,
    /// 缓存提交，由 [`CommandList::submit`] 按序号交给队列
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Idle,
    Recording,
}

/// 每个 context 一个，负责把 command buffer 按顺序交给 [`CommandQueue`]
pub struct CommandList {
    queue: Arc<CommandQueue>,
    kind: CommandListKind,
    /// 已创建但尚未 commit 的 command buffer 数量
    recording: usize,
    committed: Vec<CommandBuffer>,
}

// new & init
impl CommandList {
    pub fn new(queue: Arc<CommandQueue>, kind: CommandListKind) -> Self {
        Self {
            queue,
            kind,
            recording: 0,
            committed: Vec::new(),
        }
    }
}

// getters
impl CommandList {
    #[inline]
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    #[inline]
    pub fn kind(&self) -> CommandListKind {
        self.kind
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.kind == CommandListKind::Immediate
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        if self.recording > 0 { CommandListState::Recording } else { CommandListState::Idle }
    }

    /// deferred list 中等待 submit 的 command buffer 数量
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.committed.len()
    }
}

// tools
impl CommandList {
    pub fn create_command_buffer(&mut self, label: &str) -> CommandBuffer {
        self.recording += 1;
        self.queue.create_command_buffer(label)
    }

    /// immediate list 直接提交，`wait` 时阻塞到 GPU 完成；deferred list 只缓存
    pub fn commit(&mut self, command_buffer: CommandBuffer, wait: bool) {
        assert!(self.recording > 0, "commit on a command list that is not recording");
        self.recording -= 1;

        match self.kind {
            CommandListKind::Immediate => {
                let raw = command_buffer.raw();
                self.queue.commit_command_buffer(command_buffer);
                if wait {
                    self.queue.wait_until_completed(raw);
                }
            }
            CommandListKind::Deferred => {
                assert!(!wait, "deferred command lists cannot wait for completion");
                self.committed.push(command_buffer);
            }
        }
    }

    /// 把缓存的 command buffer 作为第 `index` 个（共 `count` 个）并行批次交给队列
    pub fn submit(&mut self, index: usize, count: usize) {
        assert_eq!(self.kind, CommandListKind::Deferred, "only deferred command lists are submitted by index");
        assert_eq!(self.recording, 0, "submit while command buffers are still recording");
        let command_buffers = std::mem::take(&mut self.committed);
        self.queue.submit_command_buffers(command_buffers, index, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::capabilities::GpuCapabilities;
    use crate::foundation::headless_device::HeadlessDevice;
    use crate::settings::CommandSettings;

    #[test]
    fn test_immediate_and_deferred() {
        let headless = Arc::new(HeadlessDevice::new(GpuCapabilities::desktop()));
        let queue = Arc::new(CommandQueue::new(headless.clone(), CommandSettings::default()));

        let mut immediate = CommandList::new(queue.clone(), CommandListKind::Immediate);
        let cb = immediate.create_command_buffer("immediate");
        assert_eq!(immediate.state(), CommandListState::Recording);
        immediate.commit(cb, true);
        assert_eq!(immediate.state(), CommandListState::Idle);
        assert_eq!(headless.executed_labels(), vec!["immediate"]);

        let mut deferred = CommandList::new(queue, CommandListKind::Deferred);
        for label in ["d0", "d1"] {
            let cb = deferred.create_command_buffer(label);
            deferred.commit(cb, false);
        }
        assert_eq!(deferred.pending_count(), 2);
        assert_eq!(headless.executed_labels().len(), 1);

        deferred.submit(0, 1);
        assert_eq!(deferred.pending_count(), 0);
        assert_eq!(headless.executed_labels(), vec!["immediate", "d0", "d1"]);
    }
}
