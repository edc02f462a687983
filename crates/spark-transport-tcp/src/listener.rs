use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use spark_transport::{
    ChannelFactory, SharedChannel, TransportAddress, TransportError,
    error::{ACCEPT, BIND},
};
use tokio::{net::TcpListener as TokioTcpListener, sync::Notify};

use crate::{TcpChannel, util::to_socket_addr};

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在不暴露 Tokio 具体类型的前提下，提供“监听 → 接受连接”的最小能力；
/// - 接受到的流立即包装为 [`TcpChannel`]，调用方拿到的就是可读写的通道。
///
/// ## 契约 (What)
/// - **前置条件**：调用方必须在 Tokio 运行时中使用该监听器；
/// - **错误语义**：绑定/接受失败时返回带操作标签的 [`TransportError::Io`]。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: TransportAddress,
}

impl TcpListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io(BIND, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| TransportError::io(BIND, err))?;
        Ok(Self {
            inner: listener,
            local_addr: TransportAddress::from(local),
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> TransportAddress {
        self.local_addr.clone()
    }

    /// 接受一个入站连接。
    pub async fn accept(&self) -> Result<TcpChannel, TransportError> {
        let (stream, remote) = self
            .inner
            .accept()
            .await
            .map_err(|err| TransportError::io(ACCEPT, err))?;
        tracing::trace!(%remote, "tcp connection accepted");
        TcpChannel::from_stream(stream).map_err(|err| TransportError::io(ACCEPT, err))
    }
}

/// TCP 通道工厂：一个监听器加上主动建连能力。
///
/// `close` 之后挂起中的 `accept` 会以 [`TransportError::ListenerClosed`] 返回，
/// 端点上下文借此结束接受循环。
#[derive(Debug)]
pub struct TcpChannelFactory {
    listener: TcpListener,
    closed: AtomicBool,
    wake: Notify,
}

impl TcpChannelFactory {
    /// 绑定监听地址。传入端口 0 时由系统分配。
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(address = %listener.local_addr(), "tcp channel factory bound");
        Ok(Arc::new(Self {
            listener,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    fn local_address(&self) -> TransportAddress {
        self.listener.local_addr()
    }

    async fn connect(&self, address: &TransportAddress) -> Result<SharedChannel, TransportError> {
        to_socket_addr(address)?;
        let channel = TcpChannel::connect(address).await?;
        Ok(Arc::new(channel))
    }

    async fn accept(&self) -> Result<SharedChannel, TransportError> {
        let closed = self.wake.notified();
        tokio::pin!(closed);
        // 先登记唤醒再检查标志，`close` 无论发生在哪一刻都不会被错过。
        closed.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ListenerClosed);
        }
        tokio::select! {
            accepted = self.listener.accept() => {
                let channel = accepted?;
                Ok(Arc::new(channel) as SharedChannel)
            }
            _ = closed => Err(TransportError::ListenerClosed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }
}
