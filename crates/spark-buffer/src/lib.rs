#![deny(unsafe_code)]
#![doc = "spark-buffer: 端口传输层的分段式发送缓冲。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：发送端把不同宽度的基本类型写入各自的段，接收端无需模式信息即可按同样顺序还原；缓冲在多条连接之间只读共享，回收由引用计数驱动。"]
#![doc = "- **What**：[`SendBufferPool`] 是带空闲链表的槽位池，[`SendBuffer`] 负责类型化写入，[`FrameLease`] 是翻转后的只读帧及其副本；[`frame`] 模块定义 16 字节帧头与段顺序。"]
#![doc = "- **How**：写满即报告 [`BufferFull`]，绝不静默扩容；`flip` 计算段长度与填充，使整帧长度为 8 的倍数。"]

pub mod frame;
mod pool;
pub mod primitive;
mod send_buffer;

pub use frame::{ByteOrder, FrameError, FrameHeader, Segment};
pub use pool::{PoolConfig, PoolStats, SendBufferPool};
pub use primitive::Primitive;
pub use send_buffer::{BufferFull, FrameLease, SendBuffer};
