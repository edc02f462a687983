//! 集成测试共用的上下文与端口类型构造。

#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use spark_port::{MemoryNetwork, PortType, TransportConfig, TransportContext, caps};

/// 显式接收风格端口的基础能力。
pub const EXPLICIT: &[&str] = &[
    caps::SERIALIZATION_DATA,
    caps::COMMUNICATION_RELIABLE,
    caps::COMMUNICATION_FIFO,
    caps::RECEIVE_EXPLICIT,
    caps::RECEIVE_TIMEOUT,
    caps::RECEIVE_POLL,
];

pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn port_type(extra: &[&str]) -> PortType {
    PortType::new(EXPLICIT.iter().chain(extra.iter()).copied())
}

pub fn context(network: &MemoryNetwork, name: &str) -> TransportContext {
    context_with(network, name, TransportConfig::default())
}

pub fn context_with(network: &MemoryNetwork, name: &str, config: TransportConfig) -> TransportContext {
    TransportContext::builder()
        .pool("test")
        .name(name)
        .config(config)
        .memory(network)
        .expect("创建端点上下文失败")
}

/// 在期限内轮询条件，超时返回 `false`。
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
