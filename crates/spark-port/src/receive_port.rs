//! # receive_port 模块说明
//!
//! ## 角色定位（Why）
//! - 消费者侧的公开抽象：接纳入站连接、检测完整消息、以显式接收或上行调用交付；
//! - 多条物理连接可能同时就绪，端口负责把交付串行化：任一时刻至多一条存活的消息。
//!
//! ## 执行逻辑（How）
//! 1. 握手阶段由上下文调用 [`ReceiveShared::admit`] 做准入检查，应答写出后再 `activate`；
//! 2. 每条连接持有一个 `Dissipator`，它在“空闲 / 就绪 / 被占用”三种槽位状态间流转：
//!    - 阻塞策略：每条连接一个观察线程，阻塞等待下一个控制字节；
//!    - 多路复用与专用策略：读任务把字节泵入队列并唤醒端口，端口的选择线程以不阻塞方式扫描空闲槽位；
//! 3. 检测到 `NEW_MESSAGE` 的连接进入就绪队列；接收、轮询或上行调用线程从队首取出并构造 [`ReadMessage`]；
//! 4. 消息结束后槽位回到空闲，等待检测下一条消息；读取失败或发送方关闭时连接被拆除并通知。
//!
//! ## 契约（What）
//! - 初始状态下连接与消息上行调用都处于禁用；
//! - 上行调用风格的端口不允许显式 `receive`；
//! - 超时返回的接收不会消耗随后到达的消息；
//! - `close` 等待所有发送方断开，`close_timeout` 超时后以合成的丢失事件强制拆除剩余连接。

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use spark_transport::{SharedChannel, ShutdownDirection};
use tokio::sync::{mpsc, watch};

use crate::{
    IoStrategy, PortError, PortType, ReadMessage, ReceivePortId, SendPortId,
    caps,
    context::ContextInner,
    dissipator::{BlockingSource, ByteSource, Dissipator, Inbound, QueueSource, Wait, pump},
    protocol::{ConnectReply, HandshakeRequest},
    stats::{self, PortCounters},
    upcall::{MessageUpcall, ReceivePortConnectUpcall, UpcallScope, in_upcall},
};

/// 端口内一条入站连接的键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey(u64);

enum Slot {
    /// 握手应答尚未写出。
    Pending,
    /// 等待检测下一条消息。
    Idle(Box<Dissipator>),
    /// 已检测到新消息，等待交付。
    Ready(Box<Dissipator>),
    /// 正在检测或正在被消息读取。
    Busy,
}

impl Slot {
    fn take_idle(&mut self) -> Option<Box<Dissipator>> {
        match std::mem::replace(self, Slot::Busy) {
            Slot::Idle(dissipator) => Some(dissipator),
            other => {
                *self = other;
                None
            }
        }
    }

    fn take_ready(&mut self) -> Option<Box<Dissipator>> {
        match std::mem::replace(self, Slot::Busy) {
            Slot::Ready(dissipator) => Some(dissipator),
            other => {
                *self = other;
                None
            }
        }
    }
}

struct InboundConnection {
    origin: SendPortId,
    channel: SharedChannel,
    slot: Slot,
    cancel: watch::Sender<bool>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct ReceiveState {
    connections: HashMap<ConnectionKey, InboundConnection>,
    ready: VecDeque<ConnectionKey>,
    next_key: u64,
    generation: u64,
    active: bool,
    connections_enabled: bool,
    upcalls_enabled: bool,
    closing: bool,
    closed: bool,
    gained: Vec<SendPortId>,
    lost: Vec<SendPortId>,
}

impl ReceiveState {
    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// 从就绪队列取出下一条可交付的消息。
    fn take_ready(&mut self) -> Option<(ConnectionKey, SendPortId, Box<Dissipator>)> {
        if self.active {
            return None;
        }
        while let Some(key) = self.ready.pop_front() {
            let Some(connection) = self.connections.get_mut(&key) else {
                continue;
            };
            if let Some(dissipator) = connection.slot.take_ready() {
                self.active = true;
                return Some((key, connection.origin.clone(), dissipator));
            }
        }
        None
    }
}

type Detection = (ConnectionKey, Box<Dissipator>, Result<Inbound, PortError>);

pub(crate) struct ReceiveShared {
    ctx: Arc<ContextInner>,
    id: ReceivePortId,
    port_type: PortType,
    strategy: IoStrategy,
    own_id: Bytes,
    message_upcall: Option<Arc<dyn MessageUpcall>>,
    connect_upcall: Option<Arc<dyn ReceivePortConnectUpcall>>,
    state: Mutex<ReceiveState>,
    changed: Condvar,
    counters: PortCounters,
    threads: Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<ReceiveShared>,
}

impl ReceiveShared {
    pub(crate) fn port_type(&self) -> &PortType {
        &self.port_type
    }

    fn closed_error(&self) -> PortError {
        PortError::PortClosed {
            port: self.id.name().to_owned(),
        }
    }

    fn spawn_thread(&self, role: &str, body: impl FnOnce() + Send + 'static) -> Result<(), PortError> {
        let handle = thread::Builder::new()
            .name(format!("spark-port-{role}-{}", self.id.name()))
            .spawn(body)
            .map_err(|err| PortError::io("spawn receive thread", err))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// 握手准入：检查顺序为重复连接、类型不符、未启用、扇入限制，最后询问连接上行调用。
    pub(crate) fn admit(
        &self,
        request: &HandshakeRequest,
        channel: SharedChannel,
    ) -> (ConnectReply, Option<ConnectionKey>) {
        let key = {
            let mut state = self.state.lock();
            if state.closing || state.closed {
                return (ConnectReply::NotPresent, None);
            }
            if state
                .connections
                .values()
                .any(|connection| connection.origin == request.origin)
            {
                return (ConnectReply::AlreadyConnected, None);
            }
            if request.port_type != self.port_type {
                return (ConnectReply::TypeMismatch, None);
            }
            if !state.connections_enabled {
                return (ConnectReply::Disabled, None);
            }
            if !state.connections.is_empty() && !self.port_type.allows_fan_in() {
                return (ConnectReply::NoManyToX, None);
            }
            let key = ConnectionKey(state.next_key);
            state.next_key += 1;
            let (cancel, _) = watch::channel(false);
            state.connections.insert(
                key,
                InboundConnection {
                    origin: request.origin.clone(),
                    channel,
                    slot: Slot::Pending,
                    cancel,
                    reader: None,
                },
            );
            key
        };

        if let Some(upcall) = &self.connect_upcall
            && !upcall.got_connection(&self.id, &request.origin)
        {
            self.abandon(key);
            return (ConnectReply::Denied, None);
        }
        (ConnectReply::Accepted, Some(key))
    }

    /// 撤销尚未激活的连接，不产生任何事件。
    pub(crate) fn abandon(&self, key: ConnectionKey) {
        let mut state = self.state.lock();
        if let Some(connection) = state.connections.get(&key)
            && matches!(connection.slot, Slot::Pending)
        {
            state.connections.remove(&key);
        }
    }

    /// 应答写出后启动这条连接的读取。
    pub(crate) fn activate(&self, key: ConnectionKey) {
        let origin = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(connection) = state.connections.get_mut(&key) else {
                return;
            };
            match self.start_reading(key, connection) {
                Ok(dissipator) => connection.slot = Slot::Idle(dissipator),
                Err(err) => {
                    drop(guard);
                    tracing::warn!(port = %self.id, error = %err, "failed to start reading connection");
                    self.remove_connection(key, Some(err));
                    return;
                }
            }
            let origin = connection.origin.clone();
            if self.port_type.has(caps::CONNECTION_DOWNCALLS) {
                state.gained.push(origin.clone());
            }
            state.bump();
            origin
        };
        self.changed.notify_all();
        self.counters.add(stats::CONNECTIONS, 1);
        tracing::debug!(port = %self.id, origin = %origin, "connection accepted");
        if let Some(observer) = &self.ctx.observer {
            observer.connection_gained(&origin, &self.id);
        }
    }

    fn start_reading(
        &self,
        key: ConnectionKey,
        connection: &mut InboundConnection,
    ) -> Result<Box<Dissipator>, PortError> {
        let ring_capacity = self.ctx.config.receive.ring_capacity;
        let channel = Arc::clone(&connection.channel);
        let source: Box<dyn ByteSource> = match self.strategy {
            IoStrategy::Blocking => {
                let weak = self.weak.clone();
                self.spawn_thread("conn", move || watch_connection(weak, key))?;
                Box::new(BlockingSource::new(
                    channel,
                    self.ctx.handle.clone(),
                    connection.cancel.subscribe(),
                ))
            }
            IoStrategy::Multiplexed | IoStrategy::Dedicated => {
                let handle = match self.strategy {
                    IoStrategy::Dedicated => self.ctx.worker_handle()?,
                    _ => self.ctx.handle.clone(),
                };
                let (chunks, queue) = mpsc::channel(self.ctx.config.receive.queue_depth.max(1));
                let weak = self.weak.clone();
                let wake = Arc::new(move || {
                    if let Some(port) = weak.upgrade() {
                        port.poke();
                    }
                });
                connection.reader = Some(handle.spawn(pump(channel, chunks, wake)));
                Box::new(QueueSource::new(queue))
            }
        };
        Ok(Box::new(Dissipator::new(
            source,
            ring_capacity,
            self.own_id.clone(),
        )))
    }

    fn poke(&self) {
        self.state.lock().bump();
        self.changed.notify_all();
    }

    /// 把一批检测结果写回槽位；结束或失败的连接随后拆除。
    fn apply(&self, detections: Vec<Detection>) {
        let mut finished = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for (key, dissipator, outcome) in detections {
                let Some(connection) = state.connections.get_mut(&key) else {
                    continue;
                };
                match outcome {
                    Ok(Inbound::Pending) => connection.slot = Slot::Idle(dissipator),
                    Ok(Inbound::NewMessage) => {
                        connection.slot = Slot::Ready(dissipator);
                        state.ready.push_back(key);
                    }
                    Ok(Inbound::Closed) => finished.push((key, None)),
                    Err(err) => finished.push((key, Some(err))),
                }
            }
            state.bump();
        }
        self.changed.notify_all();
        for (key, cause) in finished {
            self.remove_connection(key, cause);
        }
    }

    /// 拆除连接：取消读取、半关闭写方向作为确认，再通知回调与观察者。
    fn remove_connection(&self, key: ConnectionKey, cause: Option<PortError>) {
        let connection = {
            let mut state = self.state.lock();
            let Some(connection) = state.connections.remove(&key) else {
                return;
            };
            state.ready.retain(|ready| *ready != key);
            if self.port_type.has(caps::CONNECTION_DOWNCALLS) {
                state.lost.push(connection.origin.clone());
            }
            state.bump();
            connection
        };
        self.changed.notify_all();

        let _ = connection.cancel.send(true);
        if let Some(reader) = &connection.reader {
            reader.abort();
        }
        let channel = Arc::clone(&connection.channel);
        self.ctx.handle.spawn(async move {
            let _ = channel.shutdown(ShutdownDirection::Write).await;
        });

        let origin = connection.origin;
        match &cause {
            None => {
                self.counters.add(stats::CLOSED_CONNECTIONS, 1);
                tracing::debug!(port = %self.id, origin = %origin, "sender closed connection");
            }
            Some(err) => {
                self.counters.add(stats::LOST_CONNECTIONS, 1);
                tracing::warn!(port = %self.id, origin = %origin, cause = %err, "lost connection");
            }
        }
        if let Some(upcall) = &self.connect_upcall {
            upcall.lost_connection(&self.id, &origin, cause.as_ref());
        }
        if let Some(observer) = &self.ctx.observer {
            observer.connection_lost(&origin, &self.id, cause.as_ref());
        }
    }

    /// 构造消息；编号端口在此读出序号，失败时拆除连接并返回 `None`。
    fn open_message(
        self: &Arc<Self>,
        key: ConnectionKey,
        origin: SendPortId,
        dissipator: Box<Dissipator>,
    ) -> Option<ReadMessage> {
        let mut message = ReadMessage::new(Arc::clone(self), key, origin, dissipator);
        if self.port_type.has(caps::COMMUNICATION_NUMBERED) && message.read_sequence().is_err() {
            return None;
        }
        Some(message)
    }

    /// 由消息结束调用：交还连接、更新计数、解除串行化。
    ///
    /// `payload` 为 `None` 表示消息头都没能读出，这样的消息不计入消息数。
    pub(crate) fn finish_message(
        &self,
        key: ConnectionKey,
        dissipator: Box<Dissipator>,
        failure: Option<PortError>,
        payload: Option<u64>,
        wire_bytes: u64,
    ) {
        {
            let mut state = self.state.lock();
            state.active = false;
            if failure.is_none()
                && let Some(connection) = state.connections.get_mut(&key)
            {
                connection.slot = Slot::Idle(dissipator);
            }
            state.bump();
        }
        self.changed.notify_all();
        if let Some(payload) = payload {
            self.counters.add(stats::MESSAGES, 1);
            self.counters.add(stats::MESSAGE_BYTES, payload);
        }
        self.counters.add(stats::BYTES, wire_bytes);
        if let Some(err) = failure {
            self.remove_connection(key, Some(err));
        }
    }

    fn run_upcall(&self, mut message: ReadMessage) {
        let Some(upcall) = &self.message_upcall else {
            return;
        };
        let result = {
            let _scope = UpcallScope::enter();
            upcall.upcall(&mut message)
        };
        if let Err(err) = result {
            tracing::warn!(port = %self.id, origin = %message.origin(), error = %err, "message upcall failed");
            message.fail(err);
        }
    }

    fn check_communication(&self) -> Result<(), PortError> {
        if in_upcall() && !self.ctx.config.upcall.allow_communication {
            return Err(PortError::configuration(
                "communication inside a message upcall is not allowed",
            ));
        }
        Ok(())
    }

    fn require(&self, capability: &'static str) -> Result<(), PortError> {
        if self.port_type.has(capability) {
            return Ok(());
        }
        Err(PortError::configuration(format!(
            "port type does not support {capability}"
        )))
    }

    fn receive_until(self: &Arc<Self>, deadline: Option<Instant>) -> Result<ReadMessage, PortError> {
        if self.message_upcall.is_some() {
            return Err(PortError::configuration(
                "explicit receive on a port configured for message upcalls",
            ));
        }
        self.check_communication()?;
        loop {
            let (key, origin, dissipator) = {
                let mut state = self.state.lock();
                loop {
                    if state.closing || state.closed {
                        return Err(self.closed_error());
                    }
                    if let Some(taken) = state.take_ready() {
                        break taken;
                    }
                    match deadline {
                        Some(deadline) => {
                            if self.changed.wait_until(&mut state, deadline).timed_out() {
                                if let Some(taken) = state.take_ready() {
                                    break taken;
                                }
                                return Err(PortError::ReceiveTimedOut);
                            }
                        }
                        None => self.changed.wait(&mut state),
                    }
                }
            };
            if let Some(message) = self.open_message(key, origin, dissipator) {
                return Ok(message);
            }
        }
    }

    fn poll(self: &Arc<Self>) -> Result<Option<ReadMessage>, PortError> {
        self.require(caps::RECEIVE_POLL)?;
        self.check_communication()?;
        let taken = {
            let mut state = self.state.lock();
            if state.closing || state.closed {
                return Err(self.closed_error());
            }
            state.take_ready()
        };
        let Some((key, origin, dissipator)) = taken else {
            return Ok(None);
        };
        let Some(message) = self.open_message(key, origin, dissipator) else {
            return Ok(None);
        };
        if self.message_upcall.is_some() {
            self.run_upcall(message);
            return Ok(None);
        }
        Ok(Some(message))
    }

    fn set_flags(&self, update: impl FnOnce(&mut ReceiveState)) {
        let mut state = self.state.lock();
        update(&mut state);
        state.bump();
        drop(state);
        self.changed.notify_all();
    }

    /// 关闭等待是否已无必要：连接全部离开，或剩余连接都只剩无人交付的消息。
    fn settled(&self, state: &MutexGuard<'_, ReceiveState>) -> bool {
        if state.connections.is_empty() {
            return true;
        }
        let delivering = self.message_upcall.is_some() && state.upcalls_enabled;
        !delivering
            && !state.active
            && state
                .connections
                .values()
                .all(|connection| matches!(connection.slot, Slot::Ready(_)))
    }

    /// 上下文结束时调用：不等待发送方。
    pub(crate) fn close_forced(&self) {
        self.close(Some(Instant::now()));
    }

    fn close(&self, deadline: Option<Instant>) {
        {
            let mut state = self.state.lock();
            if state.closing || state.closed {
                return;
            }
            state.closing = true;
            state.connections_enabled = false;
            state.bump();
        }
        self.changed.notify_all();
        self.ctx.unregister_receive_port(self.id.name(), &self.weak);

        {
            let mut state = self.state.lock();
            while !self.settled(&state) {
                match deadline {
                    Some(deadline) => {
                        if self.changed.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.changed.wait(&mut state),
                }
            }
        }

        let remaining: Vec<ConnectionKey> = self.state.lock().connections.keys().copied().collect();
        for key in remaining {
            self.remove_connection(
                key,
                Some(PortError::ConnectionClosed(
                    "receive port closed before the sender disconnected".into(),
                )),
            );
        }

        self.set_flags(|state| state.closed = true);
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!(port = %self.id, "receive port closed");
    }
}

/// 阻塞策略下每条连接的观察线程。
fn watch_connection(weak: Weak<ReceiveShared>, key: ConnectionKey) {
    loop {
        let Some(port) = weak.upgrade() else {
            return;
        };
        let mut dissipator = {
            let mut state = port.state.lock();
            loop {
                if state.closed {
                    return;
                }
                let Some(connection) = state.connections.get_mut(&key) else {
                    return;
                };
                if let Some(dissipator) = connection.slot.take_idle() {
                    break dissipator;
                }
                port.changed.wait(&mut state);
            }
        };
        let outcome = dissipator.next_event(Wait::Block);
        port.apply(vec![(key, dissipator, outcome)]);
    }
}

/// 多路复用与专用策略下的选择线程：只在读任务唤醒后扫描空闲连接。
fn select_connections(weak: Weak<ReceiveShared>) {
    let mut seen = 0u64;
    loop {
        let Some(port) = weak.upgrade() else {
            return;
        };
        let batch: Vec<(ConnectionKey, Box<Dissipator>)> = {
            let mut state = port.state.lock();
            while state.generation == seen && !state.closed {
                port.changed.wait(&mut state);
            }
            if state.closed {
                return;
            }
            seen = state.generation;
            state
                .connections
                .iter_mut()
                .filter_map(|(key, connection)| connection.slot.take_idle().map(|d| (*key, d)))
                .collect()
        };
        if batch.is_empty() {
            continue;
        }
        let detections = batch
            .into_iter()
            .map(|(key, mut dissipator)| {
                let outcome = dissipator.next_event(Wait::NoWait);
                (key, dissipator, outcome)
            })
            .collect();
        port.apply(detections);
    }
}

/// 自动上行调用线程。
fn dispatch_upcalls(weak: Weak<ReceiveShared>) {
    loop {
        let Some(port) = weak.upgrade() else {
            return;
        };
        let (key, origin, dissipator) = {
            let mut state = port.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if state.upcalls_enabled
                    && let Some(taken) = state.take_ready()
                {
                    break taken;
                }
                port.changed.wait(&mut state);
            }
        };
        if let Some(message) = port.open_message(key, origin, dissipator) {
            port.run_upcall(message);
        }
    }
}

/// 接收端口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以端口名注册在端点上下文中，发送端口凭 [`ReceivePortId`] 连接过来；
/// - 对使用者隐藏连接数量与 IO 策略：无论几条连接、哪种策略，交付顺序与互斥语义一致。
///
/// ## 契约（What）
/// - 创建后须调用 [`ReceivePort::enable_connections`] 才会接纳连接；
/// - 配置了消息上行调用的端口须调用 [`ReceivePort::enable_message_upcalls`] 才会分发；
/// - 所有方法都是阻塞调用，不能在异步任务里直接调用；
/// - 析构时若尚未关闭，会立即强制关闭。
pub struct ReceivePort {
    shared: Arc<ReceiveShared>,
}

impl ReceivePort {
    pub(crate) fn create(
        ctx: Arc<ContextInner>,
        port_type: PortType,
        name: String,
        message_upcall: Option<Arc<dyn MessageUpcall>>,
        connect_upcall: Option<Arc<dyn ReceivePortConnectUpcall>>,
    ) -> Result<Self, PortError> {
        if message_upcall.is_some()
            && !port_type.has(caps::RECEIVE_AUTO_UPCALLS)
            && !port_type.has(caps::RECEIVE_POLL_UPCALLS)
        {
            return Err(PortError::configuration(
                "message upcall requires receive.autoupcalls or receive.pollupcalls",
            ));
        }
        if connect_upcall.is_some() && !port_type.has(caps::CONNECTION_UPCALLS) {
            return Err(PortError::configuration(
                "connect upcall requires connection.upcalls",
            ));
        }
        let strategy = ctx.strategy_for(&port_type);
        if strategy == IoStrategy::Dedicated {
            ctx.worker_handle()?;
        }
        let id = ReceivePortId::new(ctx.id.clone(), name);
        let auto_upcalls = message_upcall.is_some() && port_type.has(caps::RECEIVE_AUTO_UPCALLS);
        let shared = Arc::new_cyclic(|weak| ReceiveShared {
            ctx: Arc::clone(&ctx),
            own_id: id.to_bytes(),
            id,
            port_type,
            strategy,
            message_upcall,
            connect_upcall,
            state: Mutex::new(ReceiveState::default()),
            changed: Condvar::new(),
            counters: PortCounters::default(),
            threads: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });
        ctx.register_receive_port(shared.id.name(), Arc::downgrade(&shared))?;
        let port = Self { shared };

        let shared = &port.shared;
        if strategy != IoStrategy::Blocking {
            let weak = Arc::downgrade(shared);
            shared.spawn_thread("select", move || select_connections(weak))?;
        }
        if auto_upcalls {
            let weak = Arc::downgrade(shared);
            shared.spawn_thread("upcall", move || dispatch_upcalls(weak))?;
        }
        tracing::debug!(port = %shared.id, strategy = strategy.as_str(), "receive port created");
        Ok(port)
    }

    /// 端口标识，发送端口凭它连接。
    pub fn identifier(&self) -> &ReceivePortId {
        &self.shared.id
    }

    pub fn name(&self) -> &str {
        self.shared.id.name()
    }

    pub fn port_type(&self) -> &PortType {
        &self.shared.port_type
    }

    /// 实际采用的 IO 策略。
    pub fn strategy(&self) -> IoStrategy {
        self.shared.strategy
    }

    /// 开始接纳新连接，已有连接不受影响。
    pub fn enable_connections(&self) {
        self.shared.set_flags(|state| {
            if !state.closing {
                state.connections_enabled = true;
            }
        });
    }

    /// 拒绝新连接（应答 `Disabled`），已有连接不受影响。
    pub fn disable_connections(&self) {
        self.shared.set_flags(|state| state.connections_enabled = false);
    }

    /// 恢复消息上行调用的分发。
    pub fn enable_message_upcalls(&self) {
        self.shared.set_flags(|state| state.upcalls_enabled = true);
    }

    /// 暂停消息上行调用，已就绪的消息留待恢复后分发。
    pub fn disable_message_upcalls(&self) {
        self.shared.set_flags(|state| state.upcalls_enabled = false);
    }

    /// 阻塞直到下一条消息可读。
    pub fn receive(&self) -> Result<ReadMessage, PortError> {
        self.shared.require(caps::RECEIVE_EXPLICIT)?;
        self.shared.receive_until(None)
    }

    /// 在期限内等待下一条消息；`Duration::ZERO` 立即返回。
    pub fn receive_timeout(&self, timeout: Duration) -> Result<ReadMessage, PortError> {
        self.shared.require(caps::RECEIVE_TIMEOUT)?;
        self.shared.receive_until(Some(Instant::now() + timeout))
    }

    /// 不阻塞地取下一条已经完整到达的消息。
    ///
    /// 上行调用风格的端口会就地分发并返回 `None`。
    pub fn poll(&self) -> Result<Option<ReadMessage>, PortError> {
        self.shared.poll()
    }

    /// 当前连接过来的发送端口。
    pub fn connected_to(&self) -> Vec<SendPortId> {
        let state = self.shared.state.lock();
        let mut origins: Vec<SendPortId> = state
            .connections
            .values()
            .filter(|connection| !matches!(connection.slot, Slot::Pending))
            .map(|connection| connection.origin.clone())
            .collect();
        origins.sort();
        origins
    }

    /// 取走自上次调用以来新建立的连接；需要 `connection.downcalls`。
    pub fn new_connections(&self) -> Result<Vec<SendPortId>, PortError> {
        self.shared.require(caps::CONNECTION_DOWNCALLS)?;
        Ok(std::mem::take(&mut self.shared.state.lock().gained))
    }

    /// 取走自上次调用以来丢失或关闭的连接；需要 `connection.downcalls`。
    pub fn lost_connections(&self) -> Result<Vec<SendPortId>, PortError> {
        self.shared.require(caps::CONNECTION_DOWNCALLS)?;
        Ok(std::mem::take(&mut self.shared.state.lock().lost))
    }

    /// 等待所有发送方断开后关闭。
    pub fn close(&self) {
        self.shared.close(None);
    }

    /// 限时关闭；超时后剩余连接以合成的丢失事件拆除。
    pub fn close_timeout(&self, timeout: Duration) {
        self.shared.close(Some(Instant::now() + timeout));
    }

    /// 管理计数器快照。
    pub fn management_properties(&self) -> BTreeMap<String, u64> {
        self.shared.counters.snapshot()
    }

    pub fn management_property(&self, name: &str) -> Option<u64> {
        self.shared.counters.get(name)
    }

    pub fn reset_management_property(&self, name: &str) -> Result<(), PortError> {
        self.shared.counters.reset(name)
    }
}

impl Drop for ReceivePort {
    fn drop(&mut self) {
        self.shared.close_forced();
    }
}

impl core::fmt::Debug for ReceivePort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReceivePort")
            .field("id", &self.shared.id)
            .field("strategy", &self.shared.strategy)
            .finish()
    }
}
