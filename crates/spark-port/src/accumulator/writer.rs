//! 排队式策略共用的每连接写任务。

use std::sync::Weak;

use spark_buffer::FrameLease;
use spark_transport::SharedChannel;
use tokio::sync::{mpsc, oneshot};

use super::{ConnectionHandle, ConnectionSet};
use crate::PortError;

pub(crate) type JobSender = mpsc::Sender<WriteJob>;

pub(crate) enum WriteJob {
    /// 写出一帧；`done` 在写完后触发。
    Frame {
        frame: FrameLease,
        done: Option<oneshot::Sender<()>>,
    },
    /// 冲刷通道，完成后触发。
    Flush(oneshot::Sender<()>),
}

impl WriteJob {
    fn complete(self) {
        let done = match self {
            Self::Frame { done, .. } => done,
            Self::Flush(done) => Some(done),
        };
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

/// 按入队顺序写出任务；首次失败即摘除连接并退出，剩余任务随队列一起丢弃。
///
/// 丢弃的任务会释放各自的帧租约，并让等待中的完成通知以“发送端已关闭”返回。
pub(crate) async fn write_loop(
    handle: ConnectionHandle,
    channel: SharedChannel,
    mut jobs: mpsc::Receiver<WriteJob>,
    connections: Weak<ConnectionSet<JobSender>>,
) {
    while let Some(job) = jobs.recv().await {
        let result = match &job {
            WriteJob::Frame { frame, .. } => channel.write_all_vectored(&frame.chunks()).await,
            WriteJob::Flush(_) => channel.flush().await,
        };
        match result {
            Ok(()) => job.complete(),
            Err(err) => {
                drop(job);
                if let Some(connections) = connections.upgrade() {
                    connections.fail(handle, PortError::io("send frame", err));
                }
                return;
            }
        }
    }
    tracing::trace!(channel = %channel.id(), "writer finished");
}
