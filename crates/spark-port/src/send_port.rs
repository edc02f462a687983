//! # send_port 模块说明
//!
//! ## 角色定位（Why）
//! - 生产者侧的公开抽象：建立与接收端口的连接、创建出站消息、在关闭时通知每个接收方；
//! - 连接集合的增减与消息发送互斥：建连、断连、关闭都要等当前消息结束后才进行。
//!
//! ## 执行逻辑（How）
//! 1. 建连在上下文运行时上完成握手，期限由 `ConnectOptions` 决定；
//!    “接收端口未就绪”与“目标尚未监听”按指数退避重试，期限用完时报告建连超时；
//! 2. 消息以 `NEW_MESSAGE` 控制字节开头，编号端口随后写入序号；
//! 3. 连接失败由扇出器摘除并回调 [`LostConnectionSink`]，发送端口据此更新计数、
//!    丢失列表并触发断连上行调用。
//!
//! ## 契约（What）
//! - 同一发送端口任一时刻至多一条存活的 [`WriteMessage`]；
//! - `close` 发出 `CLOSE_ALL_CONNECTIONS` 并等待每个接收方确认；带期限的关闭在超时后强制断开，
//!   未送达的字节可能丢失。

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use spark_transport::{SharedChannel, TransportError};

use crate::{
    IoStrategy, PortError, PortType, ReceivePortId, RefusalReason, SendPortId, WriteMessage,
    accumulator::{
        Accumulator, BlockingAccumulator, DedicatedAccumulator, LostConnectionSink,
        MultiplexedAccumulator, close_channels,
    },
    caps,
    context::ContextInner,
    error::ConnectionsFailed,
    message::{FrameWriter, WriterState},
    protocol::{
        CLOSE_ALL_CONNECTIONS, CLOSE_ONE_CONNECTION, HandshakeRequest, NEW_MESSAGE, NEW_RECEIVER,
        read_reply, write_request,
    },
    stats::{self, PortCounters},
    upcall::{SendPortDisconnectUpcall, in_upcall},
};

/// 建连选项。
///
/// 单个目标的建连总会在期限内重试“未就绪”与“不可达”；`fill_timeout` 只影响
/// [`SendPort::connect_many`]：失败的目标是否排回队尾，直到期限用完。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// 整个建连（含重试）的期限。`None` 与 `Duration::ZERO` 都表示不设期限：
    /// 可重试的拒绝一直重试下去，每次尝试等待握手应答的时间受
    /// `connect.handshake_timeout_ms` 约束。
    pub timeout: Option<Duration>,
    /// 批量建连时，失败的目标是否在期限内再次尝试。
    pub fill_timeout: bool,
}

impl ConnectOptions {
    /// 设定期限。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            fill_timeout: false,
        }
    }

    /// 设定期限，批量建连时失败的目标在期限内轮流重试。
    pub fn retrying(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            fill_timeout: true,
        }
    }

    /// 换算成绝对期限；零长度期限视为不设期限。
    fn deadline(self) -> Option<Instant> {
        self.timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout)
    }
}

fn timed_out(target: &ReceivePortId) -> PortError {
    PortError::ConnectionTimedOut {
        target: target.clone(),
    }
}

#[derive(Default)]
struct SendState {
    message_alive: bool,
    started: bool,
    closed: bool,
    lost: Vec<ReceivePortId>,
    last_failure: Option<PortError>,
}

pub(crate) struct SendShared {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) id: SendPortId,
    pub(crate) port_type: PortType,
    pub(crate) accumulator: Box<dyn Accumulator>,
    pub(crate) counters: PortCounters,
    disconnect_upcall: Option<Arc<dyn SendPortDisconnectUpcall>>,
    state: Mutex<SendState>,
    changed: Condvar,
}

impl SendShared {
    /// 独占端口：等待当前消息（或其它连接操作）结束。
    fn acquire(&self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(self.closed_error());
            }
            if !state.message_alive {
                state.message_alive = true;
                return Ok(());
            }
            self.changed.wait(&mut state);
        }
    }

    pub(crate) fn release(&self) {
        self.state.lock().message_alive = false;
        self.changed.notify_all();
    }

    fn closed_error(&self) -> PortError {
        PortError::PortClosed {
            port: self.id.name().to_owned(),
        }
    }

    /// 本次消息开始时有连接、而现在全部丢失时返回原因。
    pub(crate) fn check_connections(&self, had_connections: bool) -> Result<(), PortError> {
        if !had_connections || self.accumulator.len() > 0 {
            return Ok(());
        }
        Err(self
            .state
            .lock()
            .last_failure
            .clone()
            .unwrap_or_else(|| PortError::ConnectionClosed("all connections were lost".into())))
    }

    fn check_connection_calls(&self) -> Result<(), PortError> {
        if in_upcall() && !self.ctx.config.upcall.allow_connections {
            return Err(PortError::configuration(
                "connection management inside a message upcall is not allowed",
            ));
        }
        Ok(())
    }

    fn send_control(&self, write: impl FnOnce(&mut FrameWriter<'_>)) {
        if self.accumulator.len() == 0 {
            return;
        }
        let mut state = WriterState::default();
        let mut writer = FrameWriter::new(self, &mut state);
        write(&mut writer);
        writer.flush();
        self.counters.add(stats::BYTES, writer.wire_bytes());
    }

    async fn handshake(&self, target: &ReceivePortId) -> Result<SharedChannel, PortError> {
        let channel = self
            .ctx
            .factory
            .connect(target.endpoint().address())
            .await
            .map_err(|err| match err {
                TransportError::Refused { .. } => PortError::ConnectionRefused {
                    target: target.clone(),
                    reason: RefusalReason::Unreachable,
                },
                TransportError::InvalidAddress { address } => PortError::configuration(format!(
                    "address `{address}` of {target} is not understood by this transport"
                )),
                other => other.into(),
            })?;
        let request = HandshakeRequest {
            origin: self.id.clone(),
            port_name: target.name().to_owned(),
            port_type: self.port_type.clone(),
        };
        write_request(channel.as_ref(), &request)
            .await
            .map_err(|err| PortError::io("write handshake", err))?;
        read_reply(channel.as_ref()).await?.into_result(target)?;
        Ok(channel)
    }

    /// 握手直到成功、遇到不可重试的失败，或期限用完。
    ///
    /// 可重试的拒绝（未就绪、不可达）按指数退避再试；没有期限时一直重试。
    fn establish(
        &self,
        target: &ReceivePortId,
        deadline: Option<Instant>,
    ) -> Result<SharedChannel, PortError> {
        let config = &self.ctx.config;
        let mut backoff = config.initial_backoff();
        loop {
            self.ctx.ensure_running()?;
            let attempt_deadline =
                deadline.unwrap_or_else(|| Instant::now() + config.handshake_timeout());
            // 计时器必须在运行时内部创建，调用方线程上没有时间驱动。
            let attempt = self.ctx.handle.block_on(async {
                tokio::time::timeout_at(attempt_deadline.into(), self.handshake(target)).await
            });
            let err = match attempt {
                Ok(Ok(channel)) => return Ok(channel),
                Ok(Err(err)) if err.is_retryable() && !err.is_timeout() => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(timed_out(target)),
            };
            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(timed_out(target));
                    }
                    remaining.min(backoff)
                }
                None => backoff,
            };
            tracing::debug!(
                port = %self.id,
                target_port = %target,
                cause = %err,
                backoff_ms = pause.as_millis() as u64,
                "receive port not reachable yet, retrying"
            );
            std::thread::sleep(pause);
            backoff = (backoff * 2).min(config.max_backoff());
        }
    }

    /// 连接集合允许再加入 `target` 吗：不可重复，单目标端口只能有一条连接。
    fn check_admission(&self, target: &ReceivePortId) -> Result<(), PortError> {
        if self.accumulator.find(target).is_some() {
            return Err(PortError::AlreadyConnected {
                target: target.clone(),
            });
        }
        if self.accumulator.len() > 0 && !self.port_type.allows_fan_out() {
            return Err(PortError::configuration(
                "port type does not allow connecting to more than one receive port",
            ));
        }
        Ok(())
    }

    fn attach(&self, target: ReceivePortId, channel: SharedChannel) -> Result<(), PortError> {
        if let Err(err) = self.acquire() {
            self.ctx.spawn_close(channel);
            return Err(err);
        }
        // 并发的建连可能都通过了握手前的检查，独占后再确认一次。
        if let Err(err) = self.check_admission(&target) {
            self.release();
            self.ctx.spawn_close(channel);
            return Err(err);
        }
        let started = self.state.lock().started;
        if started {
            self.send_control(|writer| {
                writer.write(NEW_RECEIVER);
            });
        }
        self.accumulator.add_connection(target.clone(), channel);
        self.release();
        self.counters.add(stats::CONNECTIONS, 1);
        tracing::debug!(port = %self.id, target_port = %target, "connected");
        Ok(())
    }

    fn connect(&self, target: &ReceivePortId, deadline: Option<Instant>) -> Result<(), PortError> {
        self.check_connection_calls()?;
        if self.state.lock().closed {
            return Err(self.closed_error());
        }
        self.check_admission(target)?;
        let channel = self.establish(target, deadline)?;
        self.attach(target.clone(), channel)
    }
}

impl LostConnectionSink for SendShared {
    fn connection_failed(&self, target: ReceivePortId, cause: PortError) {
        tracing::warn!(port = %self.id, target_port = %target, cause = %cause, "lost connection");
        self.counters.add(stats::LOST_CONNECTIONS, 1);
        {
            let mut state = self.state.lock();
            if self.port_type.has(caps::CONNECTION_DOWNCALLS) {
                state.lost.push(target.clone());
            }
            state.last_failure = Some(cause.clone());
        }
        let upcall = self.disconnect_upcall.clone();
        let observer = self.ctx.observer.clone();
        let port = self.id.clone();
        let notify = move || {
            if let Some(observer) = observer {
                observer.lost_connection_to(&target, &cause);
            }
            if let Some(upcall) = upcall {
                upcall.lost_connection(&port, &target, &cause);
            }
        };
        // 写任务在运行时线程上发现失败时，把用户回调挪到阻塞线程池，避免卡住 IO 线程。
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(notify);
            }
            Err(_) => notify(),
        }
    }
}

/// 发送端口。
///
/// 所有方法都是阻塞调用，不能在异步任务里直接调用。
pub struct SendPort {
    shared: Arc<SendShared>,
}

impl SendPort {
    pub(crate) fn create(
        ctx: Arc<ContextInner>,
        port_type: PortType,
        name: String,
        disconnect_upcall: Option<Arc<dyn SendPortDisconnectUpcall>>,
    ) -> Result<Self, PortError> {
        let strategy = ctx.strategy_for(&port_type);
        let worker = match strategy {
            IoStrategy::Dedicated => Some(ctx.worker_handle()?),
            _ => None,
        };
        let id = SendPortId::new(ctx.id.clone(), name);
        let shared = Arc::new_cyclic(|weak: &Weak<SendShared>| {
            let sink: Weak<dyn LostConnectionSink> = weak.clone();
            let handle = ctx.handle.clone();
            let queue_depth = ctx.config.receive.queue_depth;
            let accumulator: Box<dyn Accumulator> = match worker {
                Some(worker) => Box::new(DedicatedAccumulator::new(worker, handle, queue_depth, sink)),
                None if strategy == IoStrategy::Blocking => {
                    Box::new(BlockingAccumulator::new(handle, sink))
                }
                None => Box::new(MultiplexedAccumulator::new(handle, queue_depth, sink)),
            };
            SendShared {
                ctx: Arc::clone(&ctx),
                id,
                port_type,
                accumulator,
                counters: PortCounters::default(),
                disconnect_upcall,
                state: Mutex::new(SendState::default()),
                changed: Condvar::new(),
            }
        });
        tracing::debug!(port = %shared.id, strategy = strategy.as_str(), "send port created");
        Ok(Self { shared })
    }

    /// 端口标识。
    pub fn identifier(&self) -> &SendPortId {
        &self.shared.id
    }

    /// 端口名。
    pub fn name(&self) -> &str {
        self.shared.id.name()
    }

    /// 端口类型。
    pub fn port_type(&self) -> &PortType {
        &self.shared.port_type
    }

    /// 实际采用的 IO 策略。
    pub fn strategy(&self) -> IoStrategy {
        self.shared.accumulator.strategy()
    }

    /// 连接到接收端口，不设期限：接收端口未就绪或端点尚未监听时一直重试。
    pub fn connect(&self, target: &ReceivePortId) -> Result<(), PortError> {
        self.connect_with(target, ConnectOptions::default())
    }

    /// 在期限内连接到接收端口，期限用完返回 [`PortError::ConnectionTimedOut`]。
    ///
    /// `Duration::ZERO` 表示不设期限，与 [`SendPort::connect`] 相同。
    pub fn connect_timeout(&self, target: &ReceivePortId, timeout: Duration) -> Result<(), PortError> {
        self.connect_with(target, ConnectOptions::with_timeout(timeout))
    }

    /// 按选项连接到接收端口。
    pub fn connect_with(&self, target: &ReceivePortId, options: ConnectOptions) -> Result<(), PortError> {
        self.shared.connect(target, options.deadline())
    }

    /// 批量连接。
    ///
    /// 有期限时每个目标分得剩余时间除以剩余目标数；`fill_timeout` 为真时，
    /// 可重试的失败目标排回队尾，直到期限用完。期限用完后从未尝试的目标记为超时。
    /// 任一目标失败时返回 [`PortError::ConnectionsFailed`]，其中列出已经建立的连接。
    pub fn connect_many(&self, targets: &[ReceivePortId], options: ConnectOptions) -> Result<(), PortError> {
        let deadline = options.deadline();
        let mut todo: VecDeque<(ReceivePortId, Option<PortError>)> =
            targets.iter().map(|target| (target.clone(), None)).collect();
        let mut failures = Vec::new();
        let mut obtained = Vec::new();
        while let Some((target, previous)) = todo.pop_front() {
            let slice = match deadline {
                Some(deadline) => {
                    let share = deadline.saturating_duration_since(Instant::now())
                        / (todo.len() + 1) as u32;
                    if share.is_zero() {
                        todo.push_front((target, previous));
                        break;
                    }
                    Some(Instant::now() + share)
                }
                None => None,
            };
            match self.shared.connect(&target, slice) {
                Ok(()) => obtained.push(target),
                Err(err) if options.fill_timeout && deadline.is_some() && err.is_retryable() => {
                    todo.push_back((target, Some(err)));
                }
                Err(err) => failures.push((target, err)),
            }
        }
        failures.extend(todo.into_iter().map(|(target, previous)| {
            let err = previous.unwrap_or_else(|| timed_out(&target));
            (target, err)
        }));
        if failures.is_empty() {
            return Ok(());
        }
        Err(PortError::ConnectionsFailed(Box::new(ConnectionsFailed {
            failures,
            obtained,
        })))
    }

    /// 断开与 `target` 的连接并等待对方确认。
    pub fn disconnect(&self, target: &ReceivePortId) -> Result<(), PortError> {
        let shared = &self.shared;
        shared.check_connection_calls()?;
        shared.acquire()?;
        let Some(handle) = shared.accumulator.find(target) else {
            shared.release();
            return Err(PortError::configuration(format!("not connected to {target}")));
        };
        let encoded = target.to_bytes();
        shared.send_control(|writer| {
            writer.write(CLOSE_ONE_CONNECTION);
            writer.write_slice(&(encoded.len() as u32).to_be_bytes());
            writer.write_slice(&encoded[..]);
        });
        let channel = shared.accumulator.remove_connection(handle);
        shared.release();

        let Some(channel) = channel else {
            // 写控制帧时连接恰好失败，丢失路径已经处理过它。
            return Ok(());
        };
        shared.ctx.ensure_running()?;
        let deadline = Instant::now() + shared.ctx.config.handshake_timeout();
        let mut results = shared.ctx.handle.block_on(close_channels(
            vec![(target.clone(), channel)],
            Some(deadline),
        ));
        shared.counters.add(stats::CLOSED_CONNECTIONS, 1);
        tracing::debug!(port = %shared.id, target_port = %target, "disconnected");
        match results.pop() {
            Some((_, result)) => result,
            None => Ok(()),
        }
    }

    /// 当前连接的接收端口。
    pub fn connected_to(&self) -> Vec<ReceivePortId> {
        self.shared.accumulator.targets()
    }

    /// 取走自上次调用以来丢失的连接；需要 `connection.downcalls`。
    pub fn lost_connections(&self) -> Result<Vec<ReceivePortId>, PortError> {
        if !self.shared.port_type.has(caps::CONNECTION_DOWNCALLS) {
            return Err(PortError::configuration(
                "port type does not support connection downcalls",
            ));
        }
        Ok(std::mem::take(&mut self.shared.state.lock().lost))
    }

    /// 创建新消息；若另一条消息仍存活则阻塞等待它结束。
    pub fn new_message(&self) -> Result<WriteMessage, PortError> {
        let shared = &self.shared;
        if in_upcall() && !shared.ctx.config.upcall.allow_communication {
            return Err(PortError::configuration(
                "communication inside a message upcall is not allowed",
            ));
        }
        shared.acquire()?;
        shared.state.lock().started = true;
        let had_connections = shared.accumulator.len() > 0;
        let mut message = WriteMessage::new(Arc::clone(shared), had_connections);
        message.write_control(NEW_MESSAGE);
        if shared.port_type.has(caps::COMMUNICATION_NUMBERED) {
            let sequence = shared.ctx.next_sequence(shared.id.name());
            message.write_control(sequence);
        }
        Ok(message)
    }

    /// 通知所有接收方并等待它们确认后关闭。
    pub fn close(&self) -> Result<(), PortError> {
        self.close_inner(None)
    }

    /// 限时关闭；超时后强制断开剩余连接，未送达的字节可能丢失。
    pub fn close_timeout(&self, timeout: Duration) -> Result<(), PortError> {
        self.close_inner(Some(Instant::now() + timeout))
    }

    fn close_inner(&self, deadline: Option<Instant>) -> Result<(), PortError> {
        let shared = &self.shared;
        match shared.acquire() {
            Ok(()) => {}
            Err(PortError::PortClosed { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }
        shared.state.lock().closed = true;
        if shared.ctx.ensure_running().is_err() {
            shared.release();
            return Ok(());
        }
        shared.send_control(|writer| {
            writer.write(CLOSE_ALL_CONNECTIONS);
        });
        let results = shared.accumulator.close(deadline);
        shared.release();

        let mut first_error = None;
        for (target, result) in results {
            match result {
                Ok(()) => shared.counters.add(stats::CLOSED_CONNECTIONS, 1),
                Err(err) => {
                    shared.counters.add(stats::LOST_CONNECTIONS, 1);
                    tracing::warn!(port = %shared.id, target_port = %target, cause = %err, "close not acknowledged");
                    first_error.get_or_insert(err);
                }
            }
        }
        tracing::debug!(port = %shared.id, "send port closed");
        match (deadline, first_error) {
            (None, Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    /// 管理计数器快照。
    pub fn management_properties(&self) -> std::collections::BTreeMap<String, u64> {
        self.shared.counters.snapshot()
    }

    /// 读取单个管理计数器。
    pub fn management_property(&self, name: &str) -> Option<u64> {
        self.shared.counters.get(name)
    }

    /// 把单个管理计数器清零。
    pub fn reset_management_property(&self, name: &str) -> Result<(), PortError> {
        self.shared.counters.reset(name)
    }
}

impl Drop for SendPort {
    fn drop(&mut self) {
        let (open, busy) = {
            let state = self.shared.state.lock();
            (!state.closed, state.message_alive)
        };
        if busy {
            // 存活的消息可能属于当前线程，等待它会死锁。
            tracing::warn!(port = %self.shared.id, "send port dropped while a message is alive");
            return;
        }
        if open && self.shared.accumulator.len() > 0 {
            let timeout = self.shared.ctx.config.handshake_timeout();
            if let Err(err) = self.close_timeout(timeout) {
                tracing::warn!(port = %self.shared.id, error = %err, "implicit close failed");
            }
        }
    }
}

impl core::fmt::Debug for SendPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendPort")
            .field("id", &self.shared.id)
            .field("connections", &self.shared.accumulator.len())
            .finish()
    }
}
