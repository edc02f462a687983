/// 表示半关闭的方向。
///
/// # 契约（What）
/// - `Write`：关闭写半部，对端读到 EOF；
/// - `Read`：关闭读半部，若底层不支持则实现可视为无操作；
/// - `Both`：同时关闭读写半部，常用于连接拆除。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    /// 关闭写半部。
    Write,
    /// 关闭读半部。
    Read,
    /// 同时关闭读写半部。
    Both,
}

impl ShutdownDirection {
    /// 是否包含写方向。
    pub const fn includes_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }

    /// 是否包含读方向。
    pub const fn includes_read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }
}

impl From<ShutdownDirection> for std::net::Shutdown {
    fn from(value: ShutdownDirection) -> Self {
        match value {
            ShutdownDirection::Write => std::net::Shutdown::Write,
            ShutdownDirection::Read => std::net::Shutdown::Read,
            ShutdownDirection::Both => std::net::Shutdown::Both,
        }
    }
}
