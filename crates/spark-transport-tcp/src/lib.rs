#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：为端口传输层提供 Tokio 上的 TCP 绑定，实现
  [`spark_transport::Channel`] 与 [`spark_transport::ChannelFactory`] 两个契约。
- **架构角色**：端点上下文持有一个 [`TcpChannelFactory`]，监听入站握手并为
  发送端口主动建连；帧编解码与扇出逻辑完全不感知 TCP。

## 核心契约（What）
- **地址格式**：引导地址是 `ip:port` 文本，由 [`TcpChannelFactory::local_address`]
  产出并编码进端点标识；
- **输出保障**：通道读写半部独立加锁，读与写可以同时进行；建连成功后立即开启
  `TCP_NODELAY`，控制帧不会被 Nagle 算法延迟；
- **前置约束**：必须在 Tokio 运行时中使用。

## 实现策略（How）
- 建连与接受后使用 `TcpStream::into_split` 拆分所有权读写半部；
- 半关闭读方向借助 `socket2::SockRef`，写方向调用 `AsyncWriteExt::shutdown` 发送 FIN。

## 风险与考量（Trade-offs）
- 建连本身不设超时，调用方以 `tokio::time::timeout` 包裹；
- 未开启 `SO_REUSEPORT` 等高级选项。
"#]

mod channel;
mod listener;
mod util;

pub use channel::TcpChannel;
pub use listener::{TcpChannelFactory, TcpListener};
