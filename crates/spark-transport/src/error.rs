//! 传输层错误定义。
//!
//! 通道读写本身沿用 `std::io::Error`，以便上层直接区分 EOF、超时与拒绝；
//! 工厂层面的建连、监听失败则携带操作标签与目标地址，便于日志定位。

use std::io;

use thiserror::Error;

use crate::TransportAddress;

/// 操作标签：建立连接。
pub const CONNECT: &str = "connect";
/// 操作标签：绑定监听地址。
pub const BIND: &str = "bind";
/// 操作标签：接受入站连接。
pub const ACCEPT: &str = "accept";

/// 通道工厂层面的失败。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 目标地址无法解析为本绑定支持的格式。
    #[error("address `{address}` is not understood by this transport")]
    InvalidAddress { address: TransportAddress },

    /// 目标地址无人监听。
    #[error("connection to `{address}` refused")]
    Refused { address: TransportAddress },

    /// 监听器已经关闭，不会再产生新的入站通道。
    #[error("listener is closed")]
    ListenerClosed,

    /// 底层 IO 失败，附带操作标签。
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// 将任意 IO 错误映射为带操作标签的传输错误。
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// 转换为 `io::Error`，供只接受 IO 错误的调用链使用。
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io { source, .. } => source,
            Self::Refused { .. } => io::Error::new(io::ErrorKind::ConnectionRefused, self),
            Self::ListenerClosed => io::Error::new(io::ErrorKind::NotConnected, self),
            Self::InvalidAddress { .. } => io::Error::new(io::ErrorKind::InvalidInput, self),
        }
    }
}
