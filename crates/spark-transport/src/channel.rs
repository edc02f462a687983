use std::{borrow::Cow, io, sync::Arc};

use async_trait::async_trait;

use crate::{Result, ShutdownDirection, TransportAddress};

/// 统一的字节通道接口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 帧缓冲、扇出与解帧逻辑只依赖“读若干字节 / 写满整个缓冲 / 半关闭”三类能力，
///   与 TCP、进程内回环等具体传输解耦；
/// - 以 trait object（[`SharedChannel`]）流转，使阻塞线程、共享运行时与专用线程三种
///   IO 策略共享同一份连接对象。
///
/// ## 逻辑（How）
/// - 使用 `async_trait` 保持对象安全；
/// - 实现需允许读与写并发进行（读写半部互不阻塞），但同一方向上的调用由调用方串行化。
///
/// ## 契约（What）
/// - `read`：至少读取 1 字节后返回；返回 `Ok(0)` 表示对端已关闭写方向；
/// - `write_all`：写完整个缓冲后返回，部分写入在内部重试；
/// - `write_all_vectored`：按顺序写入多段缓冲，默认实现逐段调用 `write_all`；
/// - `flush`：把实现内部缓存的数据交给内核或对端；
/// - `shutdown`：执行半关闭，重复调用应当无害。
///
/// ## 风险提示（Trade-offs）
/// - `write_all` 在对端停止读取时会无限等待背压释放，超时需由调用方在外层包裹；
/// - 默认的 `write_all_vectored` 会产生多次系统调用，高吞吐实现应当覆盖它。
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// 返回可用于日志或追踪的通道 ID。
    fn id(&self) -> Cow<'_, str>;

    /// 对端地址（若绑定可以提供）。
    fn peer_addr(&self) -> Option<TransportAddress> {
        None
    }

    /// 读取数据到缓冲区，返回读取的字节数。
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// 写入整个缓冲区。
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// 依次写入多段缓冲区。
    async fn write_all_vectored(&self, bufs: &[&[u8]]) -> io::Result<()> {
        for buf in bufs {
            if !buf.is_empty() {
                self.write_all(buf).await?;
            }
        }
        Ok(())
    }

    /// 刷新缓冲区。
    async fn flush(&self) -> io::Result<()>;

    /// 执行半关闭。
    async fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()>;
}

/// 在各组件之间共享的通道句柄。
pub type SharedChannel = Arc<dyn Channel>;

/// 读满 `buf`；若在读满前遇到 EOF，返回 `UnexpectedEof`。
pub async fn read_exact(channel: &dyn Channel, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = channel.read(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed before the expected bytes arrived",
            ));
        }
        buf = &mut buf[n..];
    }
    Ok(())
}

/// 通道工厂：既负责主动建连，也负责产出入站通道。
///
/// # 契约（What）
/// - `local_address`：本端可被他人连接的引导地址，编码进端点标识；
/// - `connect`：向目标地址建立通道，超时由调用方以 `tokio::time::timeout` 包裹；
/// - `accept`：等待下一个入站通道；监听器关闭后返回 [`TransportError::ListenerClosed`](crate::TransportError::ListenerClosed)；
/// - `close`：停止接受新连接，不影响已建立的通道。
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    /// 本端的引导地址。
    fn local_address(&self) -> TransportAddress;

    /// 向目标地址建立通道。
    async fn connect(&self, address: &TransportAddress) -> Result<SharedChannel>;

    /// 接受一个入站通道。
    async fn accept(&self) -> Result<SharedChannel>;

    /// 停止监听。
    fn close(&self);
}
