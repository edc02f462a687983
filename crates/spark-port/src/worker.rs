//! 专用收发线程。
//!
//! 一个端点上下文至多一个：首个选用专用策略的端口触发启动，线程内运行单线程 tokio 运行时，
//! 所有专用策略的读写任务都在这里执行，调用方线程只负责排队与等待完成通知。

use std::thread::{self, JoinHandle};

use tokio::{runtime::Handle, sync::oneshot};

use crate::PortError;

pub(crate) struct DedicatedWorker {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DedicatedWorker {
    pub(crate) fn start(name: String) -> Result<Self, PortError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| PortError::io("start dedicated worker", err))?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stopped.await;
                });
                // 剩余任务持有的通道随运行时一起释放。
                runtime.shutdown_background();
            })
            .map_err(|err| PortError::io("start dedicated worker", err))?;
        tracing::debug!("dedicated send/receive worker started");
        Ok(Self {
            handle,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for DedicatedWorker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != thread::current().id()
        {
            let _ = thread.join();
        }
    }
}
