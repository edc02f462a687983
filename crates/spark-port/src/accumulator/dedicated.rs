use std::{
    cell::RefCell,
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

/// 全部写任务由一个专用线程驱动；发送方排队后等待每条连接的完成通知。
///
/// 等待结束时所有副本都已释放，原始帧因此可以解冻复用，`send` 总是归还所有权。
pub(crate) struct DedicatedAccumulator {
    connections: Arc<ConnectionSet<JobSender>>,
    worker: Handle,
    runtime: Handle,
    queue_depth: usize,
}

impl DedicatedAccumulator {
    pub(crate) fn new(
        worker: Handle,
        runtime: Handle,
        queue_depth: usize,
        sink: Weak<dyn LostConnectionSink>,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionSet::new(sink)),
            worker,
            runtime,
            queue_depth: queue_depth.max(1),
        }
    }

    fn dispatch(&self, make_job: impl Fn(oneshot::Sender<()>) -> Option<WriteJob>) {
        let mut pending = Vec::new();
        for (handle, _, jobs) in self.connections.snapshot() {
            let (done, wait) = oneshot::channel();
            let Some(job) = make_job(done) else {
                continue;
            };
            if jobs.blocking_send(job).is_err() {
                self.connections
                    .fail(handle, PortError::ConnectionClosed("writer stopped".into()));
                continue;
            }
            pending.push(wait);
        }
        for wait in pending {
            let _ = wait.blocking_recv();
        }
    }
}

impl Accumulator for DedicatedAccumulator {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::Dedicated
    }

    fn add_connection(&self, target: ReceivePortId, channel: SharedChannel) -> ConnectionHandle {
        let writer_channel = channel.clone();
        self.connections.insert(target, channel, |handle| {
            let (jobs, queue) = mpsc::channel(self.queue_depth);
            self.worker.spawn(write_loop(
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
        let count = self.connections.len();
        let replicas = RefCell::new(frame.replicate(count));
        self.dispatch(|done| {
            replicas.borrow_mut().pop().map(|frame| WriteJob::Frame {
                frame,
                done: Some(done),
            })
        });
        Some(frame)
    }

    fn flush(&self) {
        self.dispatch(|done| Some(WriteJob::Flush(done)));
    }

    fn close(&self, deadline: Option<Instant>) -> Vec<(ReceivePortId, Result<(), PortError>)> {
        self.flush();
        let channels = self
            .connections
            .drain()
            .into_iter()
            .map(|entry| (entry.target, entry.channel))
            .collect();
        self.runtime.block_on(close_channels(channels, deadline))
    }
}
