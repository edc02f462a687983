//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 端口层的每个阻塞调用要么返回结果，要么以一个明确的错误种类失败；
//! - 超时与硬失败必须可区分，调用方据此决定是否重试。
//!
//! ## 设计要求（What）
//! - 配置错误是编程错误，永不自动重试；
//! - 单个目标的建连失败按目标报告，批量建连聚合为 [`ConnectionsFailed`]；
//! - 传输 IO 错误与协议违例都按“连接丢失”处理，并以原因标注。
//!
//! ## 权衡（Trade-offs）
//! - 错误需要同时递交给调用方与丢失连接通知，因此整体实现 `Clone`，
//!   `io::Error` 以 `Arc` 包裹共享。

use std::{borrow::Cow, fmt, io, sync::Arc};

use spark_transport::TransportError;
use thiserror::Error;

use crate::{CapabilitySet, ReceivePortId, wire::DecodeError};

/// 端口层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把配置、建连、超时、传输与协议五类失败放进同一个可匹配的枚举；
/// - **契约 (What)**：`is_timeout` 只对两种超时变体为真；`is_retryable` 额外覆盖
///   “接收端口尚未就绪”与“目标暂不可达”两类拒绝，建连在期限内会自动重试它们；
/// - **权衡 (Trade-offs)**：上下文以 `String` 保存，牺牲少量分配换取可读的日志。
#[derive(Clone, Debug, Error)]
pub enum PortError {
    /// 调用与端口类型或当前状态不符。
    #[error("configuration error: {0}")]
    Configuration(Cow<'static, str>),

    /// 目标接收端口拒绝连接。
    #[error("connection to {target} refused: {reason}")]
    ConnectionRefused {
        target: ReceivePortId,
        reason: RefusalReason,
    },

    /// 已经连接到该目标。
    #[error("already connected to {target}")]
    AlreadyConnected { target: ReceivePortId },

    /// 建连未能在期限内完成。
    #[error("connection to {target} timed out")]
    ConnectionTimedOut { target: ReceivePortId },

    /// 接收未能在期限内拿到消息。
    #[error("receive timed out")]
    ReceiveTimedOut,

    /// 连接已关闭，无法继续通信。
    #[error("connection closed: {0}")]
    ConnectionClosed(Cow<'static, str>),

    /// 端口已关闭。
    #[error("port `{port}` is closed")]
    PortClosed { port: String },

    /// 批量建连中至少一个目标失败。
    #[error(transparent)]
    ConnectionsFailed(Box<ConnectionsFailed>),

    /// 底层通道 IO 失败。
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// 对端违反线格式。
    #[error("protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// 结构化字段无法解码。
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// 端口类型请求了端点不具备的能力。
    #[error("capabilities not offered: {missing}")]
    CapabilityMismatch { missing: CapabilitySet },
}

impl PortError {
    pub(crate) fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io {
            op,
            source: Arc::new(source),
        }
    }

    /// 是否为超时（建连或接收）。
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimedOut { .. } | Self::ReceiveTimedOut
        )
    }

    /// 调用方重试是否可能成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionRefused { reason, .. } => reason.is_transient(),
            other => other.is_timeout(),
        }
    }
}

impl From<TransportError> for PortError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io { op, source } => Self::Io {
                op,
                source: Arc::new(source),
            },
            other => Self::ConnectionClosed(Cow::Owned(other.to_string())),
        }
    }
}

/// 接收端口拒绝连接的原因，对应握手应答码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefusalReason {
    /// 连接上行调用拒绝了该发送端口。
    Denied,
    /// 接收端口尚未启用连接。
    Disabled,
    /// 端口类型不一致。
    TypeMismatch,
    /// 目标端点上没有该名字的接收端口。
    NotPresent,
    /// 接收端口已有连接且不支持多对一。
    NoManyToX,
    /// 传输层拒绝（目标地址不可达）。
    Unreachable,
}

impl RefusalReason {
    /// 接收端口可能稍后就绪。
    pub fn is_not_ready(self) -> bool {
        matches!(self, Self::Disabled | Self::NotPresent)
    }

    /// 稍后重试可能成功：接收端口未就绪，或目标端点尚未监听。
    pub fn is_transient(self) -> bool {
        self.is_not_ready() || self == Self::Unreachable
    }
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Denied => "denied by the receive port",
            Self::Disabled => "receive port has connections disabled",
            Self::TypeMismatch => "port types differ",
            Self::NotPresent => "receive port does not exist",
            Self::NoManyToX => "receive port accepts a single sender",
            Self::Unreachable => "endpoint unreachable",
        };
        f.write_str(text)
    }
}

/// 批量建连的聚合结果。
///
/// - `failures`：每个失败目标及其原因，包括因时间耗尽而根本没有尝试的目标；
/// - `obtained`：已经成功建立的连接，调用方可以继续使用它们。
#[derive(Clone, Debug, Error)]
#[error("{} of {} connections failed", .failures.len(), .failures.len() + .obtained.len())]
pub struct ConnectionsFailed {
    pub failures: Vec<(ReceivePortId, PortError)>,
    pub obtained: Vec<ReceivePortId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EndpointId;
    use spark_transport::TransportAddress;

    fn target() -> ReceivePortId {
        ReceivePortId::new(
            EndpointId::new("pool", "a", TransportAddress::from_text("mem:1")),
            "inbox",
        )
    }

    #[test]
    fn timeouts_are_distinguishable() {
        assert!(PortError::ReceiveTimedOut.is_timeout());
        assert!(PortError::ConnectionTimedOut { target: target() }.is_timeout());
        assert!(!PortError::protocol("bad opcode").is_timeout());
    }

    #[test]
    fn transient_refusals_are_retryable() {
        let disabled = PortError::ConnectionRefused {
            target: target(),
            reason: RefusalReason::Disabled,
        };
        let mismatch = PortError::ConnectionRefused {
            target: target(),
            reason: RefusalReason::TypeMismatch,
        };
        let unreachable = PortError::ConnectionRefused {
            target: target(),
            reason: RefusalReason::Unreachable,
        };
        assert!(disabled.is_retryable());
        assert!(unreachable.is_retryable());
        assert!(!RefusalReason::Unreachable.is_not_ready());
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn aggregate_reports_counts() {
        let failed = ConnectionsFailed {
            failures: vec![(target(), PortError::ReceiveTimedOut)],
            obtained: vec![target(), target()],
        };
        assert_eq!(failed.to_string(), "1 of 3 connections failed");
    }
}
