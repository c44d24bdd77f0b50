use crate::foundation::capabilities::PlatformClass;

/// 命令执行失败的错误分类
///
/// 致命与否完全由枚举本身决定，处理时必须穷举匹配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuErrorKind {
    Internal,
    Timeout,
    PageFault,
    Blacklisted,
    NotPermitted,
    OutOfMemory,
    InvalidResource,
    Unknown,
}

impl GpuErrorKind {
    /// PageFault / Blacklisted / Unknown 总是致命；
    /// Timeout 只在桌面平台致命，移动平台容易误报
    pub fn is_fatal(self, platform: PlatformClass) -> bool {
        match self {
            Self::PageFault | Self::Blacklisted | Self::Unknown => true,
            Self::Timeout => platform == PlatformClass::Desktop,
            Self::Internal | Self::NotPermitted | Self::OutOfMemory | Self::InvalidResource => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferStatus {
    Completed,
    Error(GpuErrorKind),
}

impl CommandBufferStatus {
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// 报告一次失败的 command buffer
///
/// 不同的错误类型使用不同的日志内容，附带 command buffer 的 label 和当时的 debug group 栈；
/// 致命错误在日志之后直接 panic。
pub fn report_command_buffer_error(kind: GpuErrorKind, label: &str, debug_groups: &[String], platform: PlatformClass) {
    let groups = if debug_groups.is_empty() { "<none>".to_string() } else { debug_groups.join(" > ") };

    match kind {
        GpuErrorKind::Internal => {
            log::error!("GPU internal error in command buffer '{label}', debug groups: {groups}")
        }
        GpuErrorKind::Timeout => {
            log::error!("GPU timeout: command buffer '{label}' took too long to execute, debug groups: {groups}")
        }
        GpuErrorKind::PageFault => {
            log::error!("GPU page fault in command buffer '{label}', invalid memory access, debug groups: {groups}")
        }
        GpuErrorKind::Blacklisted => {
            log::error!("GPU access revoked: process blacklisted while executing '{label}', debug groups: {groups}")
        }
        GpuErrorKind::NotPermitted => {
            log::error!("GPU work not permitted (background execution?) for '{label}', debug groups: {groups}")
        }
        GpuErrorKind::OutOfMemory => {
            log::error!("GPU out of memory while executing '{label}', debug groups: {groups}")
        }
        GpuErrorKind::InvalidResource => {
            log::error!("GPU invalid resource referenced by '{label}', debug groups: {groups}")
        }
        GpuErrorKind::Unknown => {
            log::error!("GPU unknown error in command buffer '{label}', debug groups: {groups}")
        }
    }

    if kind.is_fatal(platform) {
        panic!("fatal GPU error {kind:?} in command buffer '{label}'");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_per_platform() {
        use GpuErrorKind::*;
        for kind in [PageFault, Blacklisted, Unknown] {
            assert!(kind.is_fatal(PlatformClass::Desktop));
            assert!(kind.is_fatal(PlatformClass::Mobile));
        }
        assert!(Timeout.is_fatal(PlatformClass::Desktop));
        assert!(!Timeout.is_fatal(PlatformClass::Mobile));
        for kind in [Internal, NotPermitted, OutOfMemory, InvalidResource] {
            assert!(!kind.is_fatal(PlatformClass::Desktop));
            assert!(!kind.is_fatal(PlatformClass::Mobile));
        }
    }

    #[test]
    fn test_non_fatal_error_only_logs() {
        truvis_crate_tools::init_log::init_test_log();
        report_command_buffer_error(GpuErrorKind::Timeout, "frame", &["shadow".to_string()], PlatformClass::Mobile);
        report_command_buffer_error(GpuErrorKind::OutOfMemory, "frame", &[], PlatformClass::Desktop);
    }

    #[test]
    #[should_panic(expected = "fatal GPU error PageFault")]
    fn test_page_fault_is_fatal() {
        report_command_buffer_error(GpuErrorKind::PageFault, "frame", &[], PlatformClass::Mobile);
    }
}
