#![deny(unsafe_code)]
#![doc = "spark-transport: 端口传输层的字节通道契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：帧编解码、扇出与连接管理只面向统一的 `Channel` 契约编程，TCP 或进程内回环等具体绑定可以热替换。"]
#![doc = "- **What**：定义 [`Channel`] 与 [`ChannelFactory`] 两个异步 trait，提供 [`StreamChannel`] 适配任意 Tokio 字节流，并附带基于 `tokio::io::duplex` 的 [`MemoryNetwork`]。"]
#![doc = "- **How**：所有方法以 `&self` 暴露，读写半部各自持有异步互斥锁，实现全双工；错误统一映射为 [`TransportError`]。"]

pub mod addr;
pub mod channel;
pub mod error;
pub mod memory;
pub mod shutdown;
pub mod stream;

pub use addr::TransportAddress;
pub use channel::{Channel, ChannelFactory, SharedChannel, read_exact};
pub use error::TransportError;
pub use memory::{MemoryChannelFactory, MemoryNetwork};
pub use shutdown::ShutdownDirection;
pub use stream::StreamChannel;

/// 传输层统一返回别名。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;
