use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use spark_buffer::FrameLease;
use spark_transport::SharedChannel;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};

use super::{
    Accumulator, ConnectionHandle, ConnectionSet, LostConnectionSink, close_channels,
    writer::{JobSender, WriteJob, write_loop},
};
use crate::{IoStrategy, PortError, ReceivePortId};

/// 写任务跑在共享运行时上；`send` 只负责把副本排进每条连接的有界队列。
///
/// 队列满时 `send` 阻塞，慢接收方的背压因此只作用在它自己的队列上，
/// 直到所有队列都满才会卡住发送方。
pub(crate) struct MultiplexedAccumulator {
    connections: Arc<ConnectionSet<JobSender>>,
    handle: Handle,
    queue_depth: usize,
}

impl MultiplexedAccumulator {
    pub(crate) fn new(
        handle: Handle,
        queue_depth: usize,
        sink: Weak<dyn LostConnectionSink>,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionSet::new(sink)),
            handle,
            queue_depth: queue_depth.max(1),
        }
    }
}

impl Accumulator for MultiplexedAccumulator {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::Multiplexed
    }

    fn add_connection(&self, target: ReceivePortId, channel: SharedChannel) -> ConnectionHandle {
        let writer_channel = channel.clone();
        self.connections.insert(target, channel, |handle| {
            let (jobs, queue) = mpsc::channel(self.queue_depth);
            self.handle.spawn(write_loop(
                handle,
                writer_channel,
                queue,
                Arc::downgrade(&self.connections),
            ));
            jobs
        })
    }

    fn remove_connection(&self, handle: ConnectionHandle) -> Option<SharedChannel> {
        self.connections.remove(handle).map(|entry| entry.channel)
    }

    fn find(&self, target: &ReceivePortId) -> Option<ConnectionHandle> {
        self.connections.find(target)
    }

    fn targets(&self) -> Vec<ReceivePortId> {
        self.connections.targets()
    }

    fn len(&self) -> usize {
        self.connections.len()
    }

    fn send(&self, frame: FrameLease) -> Option<FrameLease> {
        let targets = self.connections.snapshot();
        if targets.is_empty() {
            return Some(frame);
        }
        let mut leases = frame.replicate(targets.len() - 1);
        leases.push(frame);
        for ((handle, _, jobs), frame) in targets.into_iter().zip(leases) {
            let queued = jobs.blocking_send(WriteJob::Frame { frame, done: None });
            if queued.is_err() {
                self.connections
                    .fail(handle, PortError::ConnectionClosed("writer stopped".into()));
            }
        }
        None
    }

    fn flush(&self) {
        let pending: Vec<oneshot::Receiver<()>> = self
            .connections
            .snapshot()
            .into_iter()
            .filter_map(|(_, _, jobs)| {
                let (done, wait) = oneshot::channel();
                jobs.blocking_send(WriteJob::Flush(done)).ok().map(|()| wait)
            })
            .collect();
        // 写任务失败时完成通知被丢弃，连接已经走了丢失路径，这里只需不再等待。
        for wait in pending {
            let _ = wait.blocking_recv();
        }
    }

    fn close(&self, deadline: Option<Instant>) -> Vec<(ReceivePortId, Result<(), PortError>)> {
        self.flush();
        let channels = self
            .connections
            .drain()
            .into_iter()
            .map(|entry| (entry.target, entry.channel))
            .collect();
        self.handle.block_on(close_channels(channels, deadline))
    }
}
