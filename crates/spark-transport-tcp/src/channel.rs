use std::{borrow::Cow, io, net::Shutdown as StdShutdown, sync::Arc};

use async_trait::async_trait;
use socket2::SockRef;
use spark_transport::{
    Channel, ShutdownDirection, TransportAddress, TransportError, error::CONNECT,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream as TokioTcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};

use crate::util::{map_connect_error, to_socket_addr};

#[derive(Debug)]
struct TcpChannelInner {
    id: String,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    peer_addr: TransportAddress,
    local_addr: TransportAddress,
}

/// TCP 通道的最小实现，封装读写与半关闭。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为端口层提供单条 TCP 连接的 [`Channel`] 实现；
/// - 在无须了解 Tokio 具体类型的情况下，完成字节流读写与半关闭。
///
/// ## 逻辑 (How)
/// - 建连后通过 `into_split` 拆出所有权读写半部，分别置于 `tokio::sync::Mutex`，
///   读与写互不阻塞，解帧线程与扇出任务可以并发使用同一条连接；
/// - 关闭读方向时借助 `socket2::SockRef` 对底层套接字执行 `shutdown(Read)`。
///
/// ## 契约 (What)
/// - `connect`：建立到目标地址的连接并开启 `TCP_NODELAY`；
/// - `peer_addr`/`local_addr`：提供结构化的地址元数据。
///
/// ## 注意事项 (Trade-offs)
/// - `write_all_vectored` 在持锁期间逐段写入，保证多段帧不会与其它写者交错。
#[derive(Clone, Debug)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

impl TcpChannel {
    pub(crate) fn from_stream(stream: TokioTcpStream) -> io::Result<Self> {
        configure(&stream)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            inner: Arc::new(TcpChannelInner {
                id: format!("tcp:{local}->{peer}"),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
                peer_addr: TransportAddress::from(peer),
                local_addr: TransportAddress::from(local),
            }),
        })
    }

    /// 建立到目标地址的连接。
    pub async fn connect(address: &TransportAddress) -> Result<Self, TransportError> {
        let socket_addr = to_socket_addr(address)?;
        let stream = TokioTcpStream::connect(socket_addr)
            .await
            .map_err(|err| map_connect_error(address, err))?;
        Self::from_stream(stream).map_err(|err| TransportError::io(CONNECT, err))
    }

    /// 获取本地地址。
    pub fn local_addr(&self) -> TransportAddress {
        self.inner.local_addr.clone()
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.inner.id)
    }

    fn peer_addr(&self) -> Option<TransportAddress> {
        Some(self.inner.peer_addr.clone())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.reader.lock().await;
        guard.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut guard = self.inner.writer.lock().await;
        guard.write_all(buf).await
    }

    async fn write_all_vectored(&self, bufs: &[&[u8]]) -> io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        for buf in bufs {
            if !buf.is_empty() {
                guard.write_all(buf).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        guard.flush().await
    }

    async fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        if direction.includes_write() {
            let mut guard = self.inner.writer.lock().await;
            ignore_not_connected(AsyncWriteExt::shutdown(&mut *guard).await)?;
        }
        if direction.includes_read() {
            let guard = self.inner.reader.lock().await;
            ignore_not_connected(sync_shutdown(guard.as_ref(), StdShutdown::Read))?;
        }
        Ok(())
    }
}

fn configure(stream: &TokioTcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_nodelay(true)?;
    sock.set_keepalive(true)
}

fn sync_shutdown(stream: &TokioTcpStream, direction: StdShutdown) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.shutdown(direction)
}

/// 对端已经断开时，半关闭失败没有可补救之处。
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
