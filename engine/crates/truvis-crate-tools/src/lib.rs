//! 在各个 crate 之间共享的小工具：日志初始化与工作区路径。

pub mod init_log;
pub mod resource;
