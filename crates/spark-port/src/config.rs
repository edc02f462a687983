//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 端点上下文的全部可调参数集中在 [`TransportConfig`]，可从 TOML 加载；
//! - 缺省值覆盖常见部署，配置文件只需写出想改的键。
//!
//! ## 契约（What）
//! - 所有分节都带 `#[serde(default)]`，未知键被拒绝，避免拼写错误悄然失效；
//! - 数值在使用前由各组件自行规整（例如段容量向下对齐到 8）。

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use spark_buffer::{ByteOrder, PoolConfig};

use crate::PortError;

/// 收发两侧的 IO 策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoStrategy {
    /// 每个连接一个阻塞线程，发送时逐个通道同步写出。
    Blocking,
    /// 共享运行时上的读写任务，发送方只负责排队。
    #[default]
    Multiplexed,
    /// 单个专用线程承担全部通道的读写，发送方排队后等待完成通知。
    Dedicated,
}

impl IoStrategy {
    /// 用于日志的名字。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Multiplexed => "multiplexed",
            Self::Dedicated => "dedicated",
        }
    }
}

/// 发送缓冲使用的字节序设置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrderSetting {
    /// 本机字节序。
    #[default]
    Native,
    /// 大端。
    Big,
    /// 小端。
    Little,
}

impl ByteOrderSetting {
    /// 解析为具体字节序。
    pub fn resolve(self) -> ByteOrder {
        match self {
            Self::Native => ByteOrder::native(),
            Self::Big => ByteOrder::Big,
            Self::Little => ByteOrder::Little,
        }
    }
}

/// 端点上下文配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// 端口类型未点名策略时采用的策略。
    pub io_strategy: IoStrategy,
    pub buffer: BufferConfig,
    pub receive: ReceiveConfig,
    pub connect: ConnectConfig,
    pub upcall: UpcallConfig,
    pub runtime: RuntimeConfig,
}

/// `[buffer]` 分节。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// 每个类型段在“缓冲已满”之前可容纳的字节数。
    pub segment_capacity: usize,
    /// 空闲槽位缓存上限。
    pub cache_size: usize,
    pub byte_order: ByteOrderSetting,
}

impl Default for BufferConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            segment_capacity: pool.segment_capacity,
            cache_size: pool.cache_size,
            byte_order: ByteOrderSetting::Native,
        }
    }
}

/// `[receive]` 分节。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveConfig {
    /// 环形接收缓冲的字节数（另有一帧大小的溢出区）。
    pub ring_capacity: usize,
    /// 读任务到解帧器之间的数据块队列深度。
    pub queue_depth: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 64 * 1024,
            queue_depth: 64,
        }
    }
}

/// `[connect]` 分节。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectConfig {
    /// 建连不设期限时等待握手应答的上限。
    pub handshake_timeout_ms: u64,
    /// “接收端口未就绪”重试的首个退避间隔。
    pub initial_backoff_ms: u64,
    /// 退避间隔上限。
    pub max_backoff_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

/// `[upcall]` 分节。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpcallConfig {
    /// 允许在消息上行调用内部收发消息。
    pub allow_communication: bool,
    /// 允许在消息上行调用内部建连或断连。
    pub allow_connections: bool,
}

/// `[runtime]` 分节。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// 上下文自有 tokio 运行时的工作线程数。
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

impl TransportConfig {
    /// 从 TOML 文本加载。
    pub fn from_toml_str(text: &str) -> Result<Self, PortError> {
        toml::from_str(text)
            .map_err(|err| PortError::configuration(format!("invalid transport config: {err}")))
    }

    /// 从 TOML 文件加载。
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, PortError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| PortError::io("read transport config", err))?;
        Self::from_toml_str(&text)
    }

    /// 发送缓冲池配置。
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            segment_capacity: self.buffer.segment_capacity,
            cache_size: self.buffer.cache_size,
            byte_order: self.buffer.byte_order.resolve(),
        }
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connect.handshake_timeout_ms.max(1))
    }

    pub(crate) fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.connect.initial_backoff_ms.max(1))
    }

    pub(crate) fn max_backoff(&self) -> Duration {
        Duration::from_millis(
            self.connect
                .max_backoff_ms
                .max(self.connect.initial_backoff_ms)
                .max(1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TransportConfig::from_toml_str("").expect("空配置应当合法");
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.io_strategy, IoStrategy::Multiplexed);
        assert_eq!(config.receive.ring_capacity, 65_536);
        assert_eq!(config.runtime.worker_threads, 2);
    }

    #[test]
    fn partial_sections_override_only_named_keys() {
        let config = TransportConfig::from_toml_str(
            r#"
            io_strategy = "dedicated"

            [buffer]
            byte_order = "big"

            [connect]
            max_backoff_ms = 50
            "#,
        )
        .expect("配置解析失败");
        assert_eq!(config.io_strategy, IoStrategy::Dedicated);
        assert_eq!(config.pool_config().byte_order, ByteOrder::Big);
        assert_eq!(config.buffer.segment_capacity, 16 * 1024);
        assert_eq!(config.max_backoff(), Duration::from_millis(50));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TransportConfig::from_toml_str("[buffer]\nsegment_size = 1\n")
            .expect_err("未知键必须报错");
        assert!(matches!(err, PortError::Configuration(_)));
    }
}
