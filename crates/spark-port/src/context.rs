//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - 一个 [`TransportContext`] 对应一个通信端点：持有 tokio 运行时、通道工厂、发送缓冲池、
//!   接收端口注册表与可选的专用收发线程；
//! - 端口只通过 `Arc<ContextInner>` 取得这些共享设施，端口之间不直接共享可变状态。
//!
//! ## 执行逻辑（How）
//! 1. 构建器先创建多线程运行时，再在其上绑定通道工厂（内存网络或 TCP）；
//! 2. 接入循环逐个接受入站通道，每个通道在独立任务中读取握手请求、查找目标端口、准入并应答；
//! 3. `end` 停止接入、强制关闭已注册的接收端口、停下专用线程并关闭运行时。
//!
//! ## 契约（What）
//! - 同一上下文内接收端口名唯一；
//! - 编号端口的序号按发送端口名在上下文内单调递增；
//! - `end` 之后任何需要运行时的操作返回 [`PortError::PortClosed`]。

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use spark_buffer::SendBufferPool;
use spark_transport::{ChannelFactory, MemoryNetwork, SharedChannel, ShutdownDirection};
use tokio::{
    runtime::{Handle, Runtime},
    task::JoinHandle,
};

use crate::{
    CapabilitySet, EndpointId, IoStrategy, PortError, PortType, ReceivePort, ReceivePortId,
    SendPort, TransportConfig, caps,
    protocol::{ConnectReply, read_request, write_reply},
    receive_port::ReceiveShared,
    upcall::{ConnectionObserver, MessageUpcall, ReceivePortConnectUpcall, SendPortDisconnectUpcall},
    worker::DedicatedWorker,
};

pub(crate) struct ContextInner {
    pub(crate) id: EndpointId,
    pub(crate) config: TransportConfig,
    pub(crate) offered: CapabilitySet,
    pub(crate) handle: Handle,
    pub(crate) factory: Arc<dyn ChannelFactory>,
    pub(crate) pool: SendBufferPool,
    pub(crate) observer: Option<Arc<dyn ConnectionObserver>>,
    runtime: Mutex<Option<Runtime>>,
    receive_ports: DashMap<String, Weak<ReceiveShared>>,
    sequencer: DashMap<String, i64>,
    worker: Mutex<Option<DedicatedWorker>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    ended: AtomicBool,
    anonymous: AtomicU64,
}

impl ContextInner {
    pub(crate) fn ensure_running(&self) -> Result<(), PortError> {
        if self.ended.load(Ordering::Acquire) {
            return Err(PortError::PortClosed {
                port: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// 端口类型声明了 IO 策略能力时以其为准，否则取配置默认值。
    pub(crate) fn strategy_for(&self, port_type: &PortType) -> IoStrategy {
        port_type.io_strategy().unwrap_or(self.config.io_strategy)
    }

    /// 取得专用收发线程的句柄，首次调用时启动它。
    pub(crate) fn worker_handle(&self) -> Result<Handle, PortError> {
        self.ensure_running()?;
        let mut worker = self.worker.lock();
        if let Some(worker) = worker.as_ref() {
            return Ok(worker.handle());
        }
        let started = DedicatedWorker::start(format!("spark-port-dedicated-{}", self.id.name()))?;
        let handle = started.handle();
        *worker = Some(started);
        Ok(handle)
    }

    pub(crate) fn next_sequence(&self, port: &str) -> i64 {
        let mut entry = self.sequencer.entry(port.to_owned()).or_insert(0);
        let sequence = *entry;
        *entry += 1;
        sequence
    }

    fn anonymous_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.anonymous.fetch_add(1, Ordering::Relaxed))
    }

    fn check_port_type(&self, port_type: &PortType) -> Result<(), PortError> {
        let missing = port_type.capabilities().unmatched(&self.offered);
        if missing.is_empty() {
            return Ok(());
        }
        Err(PortError::CapabilityMismatch { missing })
    }

    pub(crate) fn register_receive_port(
        &self,
        name: &str,
        port: Weak<ReceiveShared>,
    ) -> Result<(), PortError> {
        match self.receive_ports.entry(name.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().strong_count() > 0 {
                    return Err(PortError::configuration(format!(
                        "receive port name `{name}` is already in use"
                    )));
                }
                occupied.insert(port);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(port);
            }
        }
        Ok(())
    }

    /// 只有注册项仍指向 `port` 时才移除，避免误删同名的新端口。
    pub(crate) fn unregister_receive_port(&self, name: &str, port: &Weak<ReceiveShared>) {
        self.receive_ports
            .remove_if(name, |_, registered| Weak::ptr_eq(registered, port));
    }

    fn lookup(&self, name: &str) -> Option<Arc<ReceiveShared>> {
        self.receive_ports.get(name).and_then(|port| port.upgrade())
    }

    /// 在运行时上半关闭并丢弃一个不再使用的通道。
    pub(crate) fn spawn_close(&self, channel: SharedChannel) {
        if self.ensure_running().is_err() {
            return;
        }
        self.handle.spawn(async move {
            let _ = channel.shutdown(ShutdownDirection::Both).await;
        });
    }

    fn shutdown(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.factory.close();
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }
        // 专用线程在运行时之前停下，它的任务可能引用运行时上的通道。
        drop(self.worker.lock().take());
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::info!(endpoint = %self.id, "transport context ended");
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 接入循环：每个入站通道交给独立任务完成握手。
async fn accept_loop(context: Weak<ContextInner>, factory: Arc<dyn ChannelFactory>) {
    loop {
        let channel = match factory.accept().await {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(error = %err, "acceptor stopped");
                return;
            }
        };
        let Some(inner) = context.upgrade() else {
            return;
        };
        let timeout = inner.config.handshake_timeout();
        drop(inner);
        let context = context.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, handle_incoming(context, Arc::clone(&channel))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(channel = %channel.id(), error = %err, "inbound handshake failed");
                }
                Err(_) => {
                    tracing::warn!(channel = %channel.id(), "inbound handshake timed out");
                    let _ = channel.shutdown(ShutdownDirection::Both).await;
                }
            }
        });
    }
}

async fn handle_incoming(context: Weak<ContextInner>, channel: SharedChannel) -> Result<(), PortError> {
    let request = read_request(channel.as_ref()).await?;
    let port = context
        .upgrade()
        .and_then(|inner| inner.lookup(&request.port_name));
    let Some(port) = port else {
        tracing::debug!(port = %request.port_name, origin = %request.origin, "connect to unknown port");
        return write_reply(channel.as_ref(), ConnectReply::NotPresent)
            .await
            .map_err(|err| PortError::io("write handshake reply", err));
    };

    // 连接上行调用是用户代码，放到阻塞线程池里执行。
    let admitted = {
        let port = Arc::clone(&port);
        let channel = Arc::clone(&channel);
        tokio::task::spawn_blocking(move || port.admit(&request, channel))
            .await
            .map_err(|err| PortError::protocol(format!("connection admission panicked: {err}")))?
    };
    let (reply, key) = admitted;
    if let Err(err) = write_reply(channel.as_ref(), reply).await {
        if let Some(key) = key {
            port.abandon(key);
        }
        return Err(PortError::io("write handshake reply", err));
    }
    if let Some(key) = key {
        port.activate(key);
    }
    Ok(())
}

/// 端点上下文。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集中持有一个端点的全部共享设施，端口通过它创建并共享运行时、缓冲池与注册表；
/// - 通过构建器选择底层传输：进程内的 [`MemoryNetwork`] 用于测试与单进程部署，TCP 用于跨进程。
///
/// ## 契约（What）
/// - 克隆得到的是同一个上下文；
/// - 最后一个引用释放或显式 [`TransportContext::end`] 时停止接入并关闭运行时；
/// - 上下文的方法都是阻塞调用，不能在异步任务里直接调用。
#[derive(Clone)]
pub struct TransportContext {
    inner: Arc<ContextInner>,
}

impl TransportContext {
    pub fn builder() -> TransportContextBuilder {
        TransportContextBuilder::default()
    }

    /// 本端点的标识。
    pub fn identifier(&self) -> &EndpointId {
        &self.inner.id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// 本端点提供的能力。
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.inner.offered
    }

    /// 本端点上名为 `name` 的接收端口标识。
    pub fn receive_port_id(&self, name: impl Into<String>) -> ReceivePortId {
        ReceivePortId::new(self.inner.id.clone(), name)
    }

    /// 发送缓冲池的统计。
    pub fn pool_stats(&self) -> spark_buffer::PoolStats {
        self.inner.pool.stats()
    }

    pub fn send_port(&self, port_type: PortType) -> SendPortBuilder<'_> {
        SendPortBuilder {
            context: self,
            port_type,
            name: None,
            disconnect_upcall: None,
        }
    }

    pub fn receive_port(&self, port_type: PortType, name: impl Into<String>) -> ReceivePortBuilder<'_> {
        ReceivePortBuilder {
            context: self,
            port_type,
            name: name.into(),
            message_upcall: None,
            connect_upcall: None,
        }
    }

    /// 结束端点：停止接入、强制关闭接收端口、关闭运行时。
    pub fn end(&self) {
        let ports: Vec<Arc<ReceiveShared>> = self
            .inner
            .receive_ports
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for port in ports {
            port.close_forced();
        }
        self.inner.shutdown();
    }
}

impl core::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransportContext")
            .field("id", &self.inner.id)
            .field("receive_ports", &self.inner.receive_ports.len())
            .finish()
    }
}

/// [`TransportContext`] 的构建器。
#[derive(Default)]
pub struct TransportContextBuilder {
    pool: Option<String>,
    name: Option<String>,
    config: TransportConfig,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl TransportContextBuilder {
    /// 端点所属的池名，默认 `default`。
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// 端点名，默认由监听地址派生。
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// 接收连接增减与发送侧连接丢失的观察者，供上层做故障检测。
    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 在进程内网络上绑定端点。
    pub fn memory(self, network: &MemoryNetwork) -> Result<TransportContext, PortError> {
        let factory: Arc<dyn ChannelFactory> = Arc::new(network.bind());
        self.build(|_| Ok(factory))
    }

    /// 在 TCP 地址上绑定端点；端口号 0 表示由系统分配。
    #[cfg(feature = "tcp")]
    pub fn tcp(self, addr: std::net::SocketAddr) -> Result<TransportContext, PortError> {
        self.build(|runtime| {
            let factory = runtime.block_on(spark_transport_tcp::TcpChannelFactory::bind(addr))?;
            Ok(factory as Arc<dyn ChannelFactory>)
        })
    }

    /// 使用自定义的通道工厂。
    pub fn factory(self, factory: Arc<dyn ChannelFactory>) -> Result<TransportContext, PortError> {
        self.build(|_| Ok(factory))
    }

    fn build(
        self,
        bind: impl FnOnce(&Runtime) -> Result<Arc<dyn ChannelFactory>, PortError>,
    ) -> Result<TransportContext, PortError> {
        let config = self.config;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime.worker_threads.max(1))
            .thread_name("spark-port-io")
            .enable_all()
            .build()
            .map_err(|err| PortError::io("build runtime", err))?;
        let factory = bind(&runtime)?;
        let address = factory.local_address();
        let name = self.name.unwrap_or_else(|| match address.as_text() {
            Some(text) => text.to_owned(),
            None => format!("endpoint-{address}"),
        });
        let id = EndpointId::new(self.pool.unwrap_or_else(|| "default".to_owned()), name, address);
        let handle = runtime.handle().clone();
        let pool = SendBufferPool::new(config.pool_config());
        let inner = Arc::new(ContextInner {
            id,
            config,
            offered: CapabilitySet::new(caps::ALL.iter().copied()),
            handle,
            factory: Arc::clone(&factory),
            pool,
            observer: self.observer,
            runtime: Mutex::new(Some(runtime)),
            receive_ports: DashMap::new(),
            sequencer: DashMap::new(),
            worker: Mutex::new(None),
            acceptor: Mutex::new(None),
            ended: AtomicBool::new(false),
            anonymous: AtomicU64::new(0),
        });
        let acceptor = inner
            .handle
            .spawn(accept_loop(Arc::downgrade(&inner), factory));
        *inner.acceptor.lock() = Some(acceptor);
        tracing::info!(endpoint = %inner.id, "transport context started");
        Ok(TransportContext { inner })
    }
}

/// 发送端口构建器。
pub struct SendPortBuilder<'a> {
    context: &'a TransportContext,
    port_type: PortType,
    name: Option<String>,
    disconnect_upcall: Option<Arc<dyn SendPortDisconnectUpcall>>,
}

impl SendPortBuilder<'_> {
    /// 端口名，缺省时自动生成；编号端口的序号按此名递增。
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 连接丢失上行调用；需要端口类型包含 `connection.upcalls`。
    pub fn disconnect_upcall(mut self, upcall: Arc<dyn SendPortDisconnectUpcall>) -> Self {
        self.disconnect_upcall = Some(upcall);
        self
    }

    pub fn build(self) -> Result<SendPort, PortError> {
        let inner = &self.context.inner;
        inner.ensure_running()?;
        inner.check_port_type(&self.port_type)?;
        if self.disconnect_upcall.is_some() && !self.port_type.has(caps::CONNECTION_UPCALLS) {
            return Err(PortError::configuration(
                "disconnect upcall requires connection.upcalls",
            ));
        }
        let name = self
            .name
            .unwrap_or_else(|| inner.anonymous_name("send"));
        SendPort::create(Arc::clone(inner), self.port_type, name, self.disconnect_upcall)
    }
}

/// 接收端口构建器。
pub struct ReceivePortBuilder<'a> {
    context: &'a TransportContext,
    port_type: PortType,
    name: String,
    message_upcall: Option<Arc<dyn MessageUpcall>>,
    connect_upcall: Option<Arc<dyn ReceivePortConnectUpcall>>,
}

impl ReceivePortBuilder<'_> {
    /// 消息上行调用；设置后端口不再允许显式接收。
    pub fn message_upcall(mut self, upcall: Arc<dyn MessageUpcall>) -> Self {
        self.message_upcall = Some(upcall);
        self
    }

    /// 连接增减上行调用。
    pub fn connect_upcall(mut self, upcall: Arc<dyn ReceivePortConnectUpcall>) -> Self {
        self.connect_upcall = Some(upcall);
        self
    }

    pub fn build(self) -> Result<ReceivePort, PortError> {
        let inner = &self.context.inner;
        inner.ensure_running()?;
        inner.check_port_type(&self.port_type)?;
        ReceivePort::create(
            Arc::clone(inner),
            self.port_type,
            self.name,
            self.message_upcall,
            self.connect_upcall,
        )
    }
}
