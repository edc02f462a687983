//! 解帧器的字节来源。
//!
//! 两种来源对应两类接收策略：
//! - [`BlockingSource`]：在调用线程上直接阻塞读通道，用于每连接一线程的策略；
//! - [`QueueSource`]：读任务把数据块送入有界队列，解帧器从队列取数，用于多路复用与专用线程策略。

use std::{io, sync::Arc};

use bytes::{Buf, Bytes};
use spark_transport::SharedChannel;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
};

/// 取数时是否允许阻塞。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Block,
    NoWait,
}

/// 一次取数的结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Fill {
    Data(usize),
    Pending,
    Eof,
}

pub(crate) trait ByteSource: Send {
    fn fill(&mut self, dst: &mut [u8], wait: Wait) -> io::Result<Fill>;
}

/// 读数据块时单次读取的上限。
pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// 阻塞式来源；`NoWait` 永远返回 `Pending`。
pub(crate) struct BlockingSource {
    channel: SharedChannel,
    handle: Handle,
    cancel: watch::Receiver<bool>,
}

impl BlockingSource {
    pub(crate) fn new(channel: SharedChannel, handle: Handle, cancel: watch::Receiver<bool>) -> Self {
        Self {
            channel,
            handle,
            cancel,
        }
    }
}

impl ByteSource for BlockingSource {
    fn fill(&mut self, dst: &mut [u8], wait: Wait) -> io::Result<Fill> {
        if wait == Wait::NoWait {
            return Ok(Fill::Pending);
        }
        let channel = Arc::clone(&self.channel);
        let mut cancel = self.cancel.clone();
        let read = self.handle.block_on(async move {
            tokio::select! {
                read = channel.read(dst) => read,
                _ = cancel.wait_for(|cancelled| *cancelled) => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection torn down locally",
                )),
            }
        })?;
        Ok(if read == 0 { Fill::Eof } else { Fill::Data(read) })
    }
}

/// 队列式来源。
pub(crate) struct QueueSource {
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl QueueSource {
    pub(crate) fn new(chunks: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            chunks,
            current: Bytes::new(),
        }
    }
}

impl ByteSource for QueueSource {
    fn fill(&mut self, dst: &mut [u8], wait: Wait) -> io::Result<Fill> {
        if self.current.is_empty() {
            let next = match wait {
                Wait::Block => self.chunks.blocking_recv(),
                Wait::NoWait => match self.chunks.try_recv() {
                    Ok(chunk) => Some(chunk),
                    Err(mpsc::error::TryRecvError::Empty) => return Ok(Fill::Pending),
                    Err(mpsc::error::TryRecvError::Disconnected) => None,
                },
            };
            match next {
                Some(chunk) => self.current = chunk?,
                None => return Ok(Fill::Eof),
            }
        }
        let len = dst.len().min(self.current.len());
        dst[..len].copy_from_slice(&self.current[..len]);
        self.current.advance(len);
        Ok(Fill::Data(len))
    }
}

/// 把通道读到的数据块送进队列，每送达一块调用一次 `wake`。
///
/// 通道 EOF 时直接结束（队列关闭即 EOF）；读错误作为最后一个元素送出。
pub(crate) async fn pump(
    channel: SharedChannel,
    chunks: mpsc::Sender<io::Result<Bytes>>,
    wake: Arc<dyn Fn() + Send + Sync>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match channel.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                if chunks
                    .send(Ok(Bytes::copy_from_slice(&buf[..read])))
                    .await
                    .is_err()
                {
                    break;
                }
                wake();
            }
            Err(err) => {
                tracing::trace!(channel = %channel.id(), error = %err, "channel read failed");
                let _ = chunks.send(Err(err)).await;
                break;
            }
        }
    }
    drop(chunks);
    wake();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_source_distinguishes_pending_from_eof() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = QueueSource::new(rx);
        let mut buf = [0u8; 3];
        assert_eq!(source.fill(&mut buf, Wait::NoWait).expect("取数失败"), Fill::Pending);

        tx.try_send(Ok(Bytes::from_static(b"hello"))).expect("入队失败");
        assert_eq!(source.fill(&mut buf, Wait::NoWait).expect("取数失败"), Fill::Data(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(source.fill(&mut buf, Wait::Block).expect("取数失败"), Fill::Data(2));
        assert_eq!(&buf[..2], b"lo");

        drop(tx);
        assert_eq!(source.fill(&mut buf, Wait::NoWait).expect("取数失败"), Fill::Eof);
    }
}
