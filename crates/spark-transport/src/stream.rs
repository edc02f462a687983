use std::{borrow::Cow, io};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};

use crate::{Channel, ShutdownDirection, TransportAddress};

/// 把任意 Tokio 字节流包装为 [`Channel`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 进程内回环（`DuplexStream`）与测试桩只需实现 `AsyncRead + AsyncWrite`，
///   即可接入端口层的全部 IO 策略。
///
/// ## 逻辑 (How)
/// - 构造时以 `tokio::io::split` 拆成读/写半部，各自置于 `tokio::sync::Mutex` 中，
///   读与写可以同时进行，实现真正的全双工；
/// - `shutdown(Read)` 对通用字节流无对应操作，记为无操作；写方向调用
///   `AsyncWriteExt::shutdown`，使对端读到 EOF。
///
/// ## 契约 (What)
/// - 同一方向上的并发调用按锁顺序串行化；
/// - `peer_addr` 由构造方提供，缺省为 `None`。
#[derive(Debug)]
pub struct StreamChannel<S> {
    id: String,
    peer: Option<TransportAddress>,
    reader: AsyncMutex<ReadHalf<S>>,
    writer: AsyncMutex<WriteHalf<S>>,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// 以给定 ID 包装字节流。
    pub fn new(id: impl Into<String>, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: id.into(),
            peer: None,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
        }
    }

    /// 附加对端地址元数据。
    pub fn with_peer(mut self, peer: TransportAddress) -> Self {
        self.peer = Some(peer);
        self
    }
}

#[async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }

    fn peer_addr(&self) -> Option<TransportAddress> {
        self.peer.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.reader.lock().await;
        guard.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut guard = self.writer.lock().await;
        guard.write_all(buf).await
    }

    async fn write_all_vectored(&self, bufs: &[&[u8]]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        for buf in bufs {
            if !buf.is_empty() {
                guard.write_all(buf).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        guard.flush().await
    }

    async fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        if direction.includes_write() {
            let mut guard = self.writer.lock().await;
            match guard.shutdown().await {
                Ok(()) => {}
                // 对端已经消失时，关闭写方向的失败没有可补救之处。
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_halves_are_full_duplex() {
        let (left, right) = tokio::io::duplex(64);
        let left = StreamChannel::new("left", left);
        let right = StreamChannel::new("right", right);

        left.write_all(b"ping").await.expect("左侧写入失败");
        right.write_all(b"pong").await.expect("右侧写入失败");

        let mut buf = [0u8; 4];
        crate::read_exact(&right, &mut buf).await.expect("右侧读取失败");
        assert_eq!(&buf, b"ping");
        crate::read_exact(&left, &mut buf).await.expect("左侧读取失败");
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn write_shutdown_surfaces_as_eof() {
        let (left, right) = tokio::io::duplex(64);
        let left = StreamChannel::new("left", left);
        let right = StreamChannel::new("right", right);

        left.write_all(b"x").await.expect("写入失败");
        left.shutdown(ShutdownDirection::Write)
            .await
            .expect("半关闭失败");

        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).await.expect("读取失败"), 1);
        assert_eq!(right.read(&mut buf).await.expect("读取 EOF 失败"), 0);
    }
}
