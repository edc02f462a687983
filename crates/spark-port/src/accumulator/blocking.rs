use std::{sync::Weak, time::Instant};

use spark_buffer::FrameLease;
use spark_transport::SharedChannel;
use tokio::runtime::Handle;

use super::{
    Accumulator, ConnectionHandle, ConnectionSet, LostConnectionSink, close_channels,
};
use crate::{IoStrategy, PortError, ReceivePortId};

/// 每次发送都在调用线程上依次写完每个通道。
///
/// 写得慢的接收方会拖慢整个扇出，这是该策略换取“零排队”所付出的代价。
pub(crate) struct BlockingAccumulator {
    connections: ConnectionSet<()>,
    handle: Handle,
}

impl BlockingAccumulator {
    pub(crate) fn new(handle: Handle, sink: Weak<dyn LostConnectionSink>) -> Self {
        Self {
            connections: ConnectionSet::new(sink),
            handle,
        }
    }
}

impl Accumulator for BlockingAccumulator {
    fn strategy(&self) -> IoStrategy {
        IoStrategy::Blocking
    }

    fn add_connection(&self, target: ReceivePortId, channel: SharedChannel) -> ConnectionHandle {
        self.connections.insert(target, channel, |_| ())
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
        let chunks = frame.chunks();
        for (handle, channel, ()) in self.connections.snapshot() {
            let written = self
                .handle
                .block_on(channel.write_all_vectored(&chunks));
            if let Err(err) = written {
                self.connections.fail(handle, PortError::io("send frame", err));
            }
        }
        drop(chunks);
        Some(frame)
    }

    fn flush(&self) {
        for (handle, channel, ()) in self.connections.snapshot() {
            if let Err(err) = self.handle.block_on(channel.flush()) {
                self.connections.fail(handle, PortError::io("flush", err));
            }
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
