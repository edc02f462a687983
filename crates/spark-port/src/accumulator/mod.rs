//! # accumulator 模块说明
//!
//! ## 角色定位（Why）
//! - 一个发送端口对应一个 [`Accumulator`]：持有全部出站连接，把翻转后的帧扇出给它们；
//! - 一条连接写失败只摘除它自己并通知发送端口，其余连接照常收到完整的帧。
//!
//! ## 三种策略（How）
//! - [`BlockingAccumulator`]：在调用线程上逐个通道同步写出；
//! - [`MultiplexedAccumulator`]：每条连接一个写任务跑在共享运行时上，调用方排队后立即返回；
//! - [`DedicatedAccumulator`]：写任务跑在专用线程上，调用方排队后等待全部完成通知。
//!
//! ## 契约（What）
//! - `send` 返回 `Some(frame)` 当且仅当帧的所有权回到调用方（调用方可以解冻复用它）；
//! - 连接摘除经过 [`ConnectionSet::fail`] 这一道闸门，同一连接的丢失通知恰好一次；
//! - `close` 先冲刷，再对每条连接半关闭写方向并读到 EOF 作为对端确认。

mod blocking;
mod dedicated;
mod multiplexed;
mod writer;

use std::{
    io,
    sync::{
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use spark_buffer::FrameLease;
use spark_transport::{SharedChannel, ShutdownDirection};

pub(crate) use blocking::BlockingAccumulator;
pub(crate) use dedicated::DedicatedAccumulator;
pub(crate) use multiplexed::MultiplexedAccumulator;

use crate::{IoStrategy, PortError, ReceivePortId};

/// 出站连接句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionHandle(u64);

/// 出站连接失败的接收方，由发送端口实现。
pub(crate) trait LostConnectionSink: Send + Sync {
    fn connection_failed(&self, target: ReceivePortId, cause: PortError);
}

/// 发送侧的扇出器。
pub(crate) trait Accumulator: Send + Sync {
    fn strategy(&self) -> IoStrategy;

    /// 登记一条已完成握手的连接。
    fn add_connection(&self, target: ReceivePortId, channel: SharedChannel) -> ConnectionHandle;

    /// 摘除连接（不触发丢失通知），返回其通道以便调用方收尾。
    fn remove_connection(&self, handle: ConnectionHandle) -> Option<SharedChannel>;

    fn find(&self, target: &ReceivePortId) -> Option<ConnectionHandle>;

    fn targets(&self) -> Vec<ReceivePortId>;

    fn len(&self) -> usize;

    /// 把帧写往全部连接。
    fn send(&self, frame: FrameLease) -> Option<FrameLease>;

    /// 阻塞到此前交付的字节都已交给各自的通道。
    fn flush(&self);

    /// 冲刷后关闭全部连接；返回每个目标的关闭结果。
    fn close(&self, deadline: Option<Instant>) -> Vec<(ReceivePortId, Result<(), PortError>)>;
}

pub(crate) struct Outbound<W> {
    pub(crate) handle: ConnectionHandle,
    pub(crate) target: ReceivePortId,
    pub(crate) channel: SharedChannel,
    pub(crate) writer: W,
}

/// 出站连接集合，只在本端口的锁下修改。
pub(crate) struct ConnectionSet<W> {
    entries: Mutex<Vec<Outbound<W>>>,
    next_handle: AtomicU64,
    sink: Weak<dyn LostConnectionSink>,
}

impl<W: Clone> ConnectionSet<W> {
    pub(crate) fn new(sink: Weak<dyn LostConnectionSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            sink,
        }
    }

    pub(crate) fn insert(
        &self,
        target: ReceivePortId,
        channel: SharedChannel,
        writer: impl FnOnce(ConnectionHandle) -> W,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let writer = writer(handle);
        self.entries.lock().push(Outbound {
            handle,
            target,
            channel,
            writer,
        });
        handle
    }

    pub(crate) fn remove(&self, handle: ConnectionHandle) -> Option<Outbound<W>> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|entry| entry.handle == handle)?;
        Some(entries.swap_remove(index))
    }

    pub(crate) fn drain(&self) -> Vec<Outbound<W>> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub(crate) fn find(&self, target: &ReceivePortId) -> Option<ConnectionHandle> {
        self.entries
            .lock()
            .iter()
            .find(|entry| &entry.target == target)
            .map(|entry| entry.handle)
    }

    pub(crate) fn snapshot(&self) -> Vec<(ConnectionHandle, SharedChannel, W)> {
        self.entries
            .lock()
            .iter()
            .map(|entry| (entry.handle, entry.channel.clone(), entry.writer.clone()))
            .collect()
    }

    pub(crate) fn targets(&self) -> Vec<ReceivePortId> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.target.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 摘除失败的连接并通知发送端口；同一连接只有第一次调用生效。
    pub(crate) fn fail(&self, handle: ConnectionHandle, cause: PortError) -> bool {
        let Some(entry) = self.remove(handle) else {
            return false;
        };
        tracing::debug!(
            target_port = %entry.target,
            channel = %entry.channel.id(),
            cause = %cause,
            "outbound connection lost"
        );
        if let Some(sink) = self.sink.upgrade() {
            sink.connection_failed(entry.target, cause);
        }
        true
    }
}

/// 对若干通道执行有确认的关闭：半关闭写方向，然后读到 EOF。
pub(crate) async fn close_channels(
    channels: Vec<(ReceivePortId, SharedChannel)>,
    deadline: Option<Instant>,
) -> Vec<(ReceivePortId, Result<(), PortError>)> {
    let closing = channels.into_iter().map(|(target, channel)| async move {
        let acknowledged = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(deadline.into(), await_close_ack(&channel))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "close was not acknowledged in time",
                        ))
                    })
            }
            None => await_close_ack(&channel).await,
        };
        let result = match acknowledged {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(target_port = %target, error = %err, "forcing connection close");
                let _ = channel.shutdown(ShutdownDirection::Both).await;
                Err(PortError::io("close connection", err))
            }
        };
        (target, result)
    });
    futures::future::join_all(closing).await
}

async fn await_close_ack(channel: &SharedChannel) -> io::Result<()> {
    channel.flush().await?;
    channel.shutdown(ShutdownDirection::Write).await?;
    let mut scratch = [0u8; 64];
    while channel.read(&mut scratch).await? != 0 {}
    Ok(())
}
