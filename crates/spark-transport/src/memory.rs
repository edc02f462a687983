//! 进程内回环网络。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 在单进程内运行多个端点（典型场景是集成测试）时，无需占用真实端口即可获得
//!   与 TCP 语义一致的字节流：有序、可靠、可半关闭；
//! - 网络对象由调用方显式构造并在端点之间共享，不依赖任何全局静态状态。
//!
//! ## 逻辑（How）
//! - [`MemoryNetwork`] 维护 `地址 → 入站队列` 映射；
//! - `connect` 创建一对 `tokio::io::duplex`，把一端投递到目标的入站队列，另一端包装为
//!   [`StreamChannel`] 返回；
//! - 目标地址未注册时立即返回 [`TransportError::Refused`]，与 TCP 的 RST 行为一致。
//!
//! ## 风险/权衡（Trade-offs）
//! - 入站队列有界（`BACKLOG`）；若监听方长期不 `accept`，建连方会在投递时等待，
//!   这与 TCP backlog 满时的表现相仿，建连超时需由调用方控制。

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    io::DuplexStream,
    sync::{Mutex as AsyncMutex, mpsc},
};

use crate::{
    ChannelFactory, Result, SharedChannel, StreamChannel, TransportAddress, TransportError,
};

/// 单个监听者可积压的未接受连接数。
const BACKLOG: usize = 64;
/// 默认的 duplex 管道容量（字节）。
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// 进程内网络：多个 [`MemoryChannelFactory`] 通过同一个网络实例互相可达。
#[derive(Clone, Debug)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    listeners: Mutex<HashMap<TransportAddress, mpsc::Sender<Incoming>>>,
    next_id: AtomicU64,
    pipe_capacity: usize,
}

#[derive(Debug)]
struct Incoming {
    stream: DuplexStream,
    peer: TransportAddress,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }
}

impl MemoryNetwork {
    /// 创建空网络。
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定每条管道单方向的缓冲容量。
    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                pipe_capacity: pipe_capacity.max(1),
            }),
        }
    }

    /// 在网络中登记一个新地址并返回对应的通道工厂。
    pub fn bind(&self) -> MemoryChannelFactory {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let address = TransportAddress::from_text(&format!("mem:{id}"));
        let (tx, rx) = mpsc::channel(BACKLOG);
        self.inner.listeners.lock().insert(address.clone(), tx);
        tracing::trace!(%address, "memory listener bound");
        MemoryChannelFactory {
            network: self.clone(),
            address,
            incoming: AsyncMutex::new(rx),
        }
    }

    /// 当前登记的监听地址数量。
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn unbind(&self, address: &TransportAddress) {
        if self.inner.listeners.lock().remove(address).is_some() {
            tracing::trace!(%address, "memory listener unbound");
        }
    }

    fn sender_for(&self, address: &TransportAddress) -> Option<mpsc::Sender<Incoming>> {
        self.inner.listeners.lock().get(address).cloned()
    }

    fn next_channel_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// 进程内网络中的一个端点。
#[derive(Debug)]
pub struct MemoryChannelFactory {
    network: MemoryNetwork,
    address: TransportAddress,
    incoming: AsyncMutex<mpsc::Receiver<Incoming>>,
}

impl MemoryChannelFactory {
    /// 返回所属网络。
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    fn local_address(&self) -> TransportAddress {
        self.address.clone()
    }

    async fn connect(&self, address: &TransportAddress) -> Result<SharedChannel> {
        let sender = self
            .network
            .sender_for(address)
            .ok_or_else(|| TransportError::Refused {
                address: address.clone(),
            })?;
        let (local, remote) = tokio::io::duplex(self.network.inner.pipe_capacity);
        sender
            .send(Incoming {
                stream: remote,
                peer: self.address.clone(),
            })
            .await
            .map_err(|_| TransportError::Refused {
                address: address.clone(),
            })?;
        let id = self.network.next_channel_id();
        let channel = StreamChannel::new(format!("{}->{address}#{id}", self.address), local)
            .with_peer(address.clone());
        Ok(Arc::new(channel))
    }

    async fn accept(&self) -> Result<SharedChannel> {
        let mut incoming = self.incoming.lock().await;
        let Incoming { stream, peer } = incoming
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)?;
        let id = self.network.next_channel_id();
        let channel =
            StreamChannel::new(format!("{}<-{peer}#{id}", self.address), stream).with_peer(peer);
        Ok(Arc::new(channel))
    }

    fn close(&self) {
        self.network.unbind(&self.address);
    }
}

impl Drop for MemoryChannelFactory {
    fn drop(&mut self) {
        self.network.unbind(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_exact;

    #[tokio::test]
    async fn connect_reaches_bound_listener() {
        let network = MemoryNetwork::new();
        let server = network.bind();
        let client = network.bind();

        let outbound = client
            .connect(&server.local_address())
            .await
            .expect("建连失败");
        let inbound = server.accept().await.expect("接受连接失败");
        assert_eq!(inbound.peer_addr(), Some(client.local_address()));

        outbound.write_all(b"hello").await.expect("写入失败");
        let mut buf = [0u8; 5];
        read_exact(inbound.as_ref(), &mut buf)
            .await
            .expect("读取失败");
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unknown_address_is_refused() {
        let network = MemoryNetwork::new();
        let client = network.bind();
        let err = client
            .connect(&TransportAddress::from_text("mem:999"))
            .await
            .err()
            .expect("未登记地址必须拒绝");
        assert!(matches!(err, TransportError::Refused { .. }));
    }

    #[tokio::test]
    async fn closed_listener_leaves_the_network() {
        let network = MemoryNetwork::new();
        let server = network.bind();
        let address = server.local_address();
        assert_eq!(network.listener_count(), 1);
        drop(server);
        assert_eq!(network.listener_count(), 0);

        let client = network.bind();
        assert!(client.connect(&address).await.is_err());
    }
}
