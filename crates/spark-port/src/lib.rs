#![deny(unsafe_code)]
#![doc = "spark-port: 能力协商的端口到端口消息传输层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：上层（成员管理、组通信）只关心“把一条类型化消息从发送端口送到若干接收端口”，不关心帧格式、扇出与连接生命周期。"]
#![doc = "- **What**：提供 [`TransportContext`]、[`SendPort`]、[`ReceivePort`] 与 [`WriteMessage`]/[`ReadMessage`]，端口类型以 [`CapabilitySet`] 描述并在握手时核对。"]
#![doc = "- **How**：发送侧经 `spark-buffer` 的七段帧缓冲成帧，按阻塞、多路复用或专用线程三种策略扇出到 `spark-transport` 通道；接收侧逐连接还原帧并串行交付。"]
#![doc = ""]
#![doc = "== 使用约束 =="]
#![doc = "- 端口与上下文的方法都是阻塞调用，应在普通线程中使用，不能在 Tokio 任务中直接调用。"]
#![doc = "- 一个发送端口任一时刻至多一条存活的写消息，一个接收端口任一时刻至多一条存活的读消息或上行调用。"]

mod accumulator;
pub mod capability;
pub mod config;
mod context;
mod dissipator;
pub mod error;
pub mod ident;
mod message;
pub mod port_type;
mod protocol;
mod receive_port;
mod send_port;
pub mod stats;
pub mod upcall;
mod wire;
mod worker;

pub use capability::CapabilitySet;
pub use config::{
    BufferConfig, ByteOrderSetting, ConnectConfig, IoStrategy, ReceiveConfig, RuntimeConfig,
    TransportConfig, UpcallConfig,
};
pub use context::{ReceivePortBuilder, SendPortBuilder, TransportContext, TransportContextBuilder};
pub use error::{ConnectionsFailed, PortError, RefusalReason};
pub use ident::{EndpointId, ReceivePortId, SendPortId};
pub use message::{ReadMessage, WriteMessage};
pub use port_type::{PortType, caps};
pub use protocol::ConnectReply;
pub use receive_port::ReceivePort;
pub use send_port::{ConnectOptions, SendPort};
pub use upcall::{ConnectionObserver, MessageUpcall, ReceivePortConnectUpcall, SendPortDisconnectUpcall};
pub use wire::DecodeError;

pub use spark_buffer::Primitive;
pub use spark_transport::{MemoryNetwork, TransportAddress};
