//! # message 模块说明
//!
//! ## 角色定位（Why）
//! - [`WriteMessage`] 与 [`ReadMessage`] 是一次消息交换的两端：发送侧按程序顺序写入基本类型，
//!   接收侧按同样的类型顺序读出；
//! - 两者都以所有权表达“消息存活”：存活期间所属端口不会开始下一条消息。
//!
//! ## 执行逻辑（How）
//! - 写入落在当前发送缓冲；某段写满时当前缓冲翻转成帧交给扇出器，换新缓冲后重试同一次写入；
//! - 读取委托给连接上的 `Dissipator`，段耗尽时自动接收下一帧；
//! - 结束时（显式 `finish` 或析构）发送侧冲刷剩余数据并释放端口，
//!   接收侧丢弃未读内容并把连接交还给端口继续检测下一条消息。
//!
//! ## 契约（What）
//! - 数组以元素为单位拆分到多帧，字符串先写 `i32` 字节长度（INTS 段）再写 UTF-8 字节（BYTES 段）；
//! - 读取失败会记录原因，消息结束时该连接以此原因拆除；
//! - 只声明 `serialization.byte` 的端口仅接受字节类写入。

use std::sync::Arc;

use spark_buffer::{Primitive, Segment, SendBuffer};

use crate::{
    PortError, SendPortId,
    caps,
    dissipator::Dissipator,
    receive_port::{ConnectionKey, ReceiveShared},
    send_port::SendShared,
    stats,
    upcall::UpcallScope,
};

/// 写入中的发送缓冲及其累计线上字节。
#[derive(Default)]
pub(crate) struct WriterState {
    buffer: Option<SendBuffer>,
    wire_bytes: u64,
}

/// 把值写进发送缓冲、在段满时发送的写入器。
pub(crate) struct FrameWriter<'a> {
    port: &'a SendShared,
    state: &'a mut WriterState,
}

impl<'a> FrameWriter<'a> {
    pub(crate) fn new(port: &'a SendShared, state: &'a mut WriterState) -> Self {
        Self { port, state }
    }

    fn buffer(&mut self) -> &mut SendBuffer {
        let pool = &self.port.ctx.pool;
        self.state.buffer.get_or_insert_with(|| pool.acquire())
    }

    /// 写入单个值；返回期间是否发送过帧。
    pub(crate) fn write<T: Primitive>(&mut self, value: T) -> bool {
        let mut transmitted = false;
        // 空缓冲的段容量至少容纳一个最宽的值，重试必然成功。
        while self.buffer().write(value).is_err() {
            self.transmit();
            transmitted = true;
        }
        transmitted
    }

    /// 写入一组值，按需跨帧拆分；返回期间是否发送过帧。
    pub(crate) fn write_slice<T: Primitive>(&mut self, values: &[T]) -> bool {
        let mut rest = values;
        let mut transmitted = false;
        loop {
            let written = self.buffer().write_slice(rest);
            rest = &rest[written..];
            if rest.is_empty() {
                return transmitted;
            }
            self.transmit();
            transmitted = true;
        }
    }

    /// 翻转当前缓冲并交给扇出器。
    pub(crate) fn transmit(&mut self) {
        let Some(buffer) = self.state.buffer.take() else {
            return;
        };
        if buffer.is_empty() {
            self.state.buffer = Some(buffer);
            return;
        }
        let frame = buffer.flip();
        let fan_out = self.port.accumulator.len().max(1) as u64;
        self.state.wire_bytes += frame.len() as u64 * fan_out;
        tracing::trace!(port = %self.port.id, len = frame.len(), "frame handed to accumulator");
        if let Some(returned) = self.port.accumulator.send(frame) {
            self.state.buffer = returned.into_writable().ok();
        }
    }

    /// 发送剩余数据并等待写出完成。
    pub(crate) fn flush(&mut self) {
        self.transmit();
        self.port.accumulator.flush();
    }

    pub(crate) fn wire_bytes(&self) -> u64 {
        self.state.wire_bytes
    }
}

/// 出站消息。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把一次“写若干值”的交换限定在一个可结束的对象里，发送端口借此保证消息之间不交错；
/// - 调用方只面对类型化写入，帧切分与扇出对它透明。
///
/// ## 契约（What）
/// - 由 [`crate::SendPort::new_message`] 创建，首个字节是 `NEW_MESSAGE` 控制字节；
/// - [`WriteMessage::finish`] 返回本条消息写入的有效字节数；未显式结束时析构会自动结束；
/// - 本条消息开始时存在连接而中途全部丢失，后续写入与结束返回错误。
pub struct WriteMessage {
    port: Arc<SendShared>,
    writer: WriterState,
    had_connections: bool,
    byte_only: bool,
    payload: u64,
    finished: bool,
}

impl WriteMessage {
    pub(crate) fn new(port: Arc<SendShared>, had_connections: bool) -> Self {
        let port_type = &port.port_type;
        let byte_only =
            port_type.has(caps::SERIALIZATION_BYTE) && !port_type.has(caps::SERIALIZATION_DATA);
        Self {
            port,
            writer: WriterState::default(),
            had_connections,
            byte_only,
            payload: 0,
            finished: false,
        }
    }

    /// 控制字节与序号不计入有效负载，也不受序列化限制。
    pub(crate) fn write_control<T: Primitive>(&mut self, value: T) {
        FrameWriter::new(&self.port, &mut self.writer).write(value);
    }

    fn admit<T: Primitive>(&self) -> Result<(), PortError> {
        if self.byte_only && T::SEGMENT != Segment::Bytes {
            return Err(PortError::configuration(
                "port type only supports byte serialization",
            ));
        }
        Ok(())
    }

    /// 写入一个基本类型值。
    pub fn write<T: Primitive>(&mut self, value: T) -> Result<(), PortError> {
        self.admit::<T>()?;
        let transmitted = FrameWriter::new(&self.port, &mut self.writer).write(value);
        self.payload += T::SEGMENT.width() as u64;
        if transmitted {
            self.port.check_connections(self.had_connections)?;
        }
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_byte(&mut self, value: i8) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_char(&mut self, value: u16) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_short(&mut self, value: i16) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_long(&mut self, value: i64) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_float(&mut self, value: f32) -> Result<(), PortError> {
        self.write(value)
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), PortError> {
        self.write(value)
    }

    /// 写入一组同类型值；超出单帧容量时按元素拆分到多帧。
    pub fn write_array<T: Primitive>(&mut self, values: &[T]) -> Result<(), PortError> {
        self.admit::<T>()?;
        let transmitted = FrameWriter::new(&self.port, &mut self.writer).write_slice(values);
        self.payload += (values.len() * T::SEGMENT.width()) as u64;
        if transmitted {
            self.port.check_connections(self.had_connections)?;
        }
        Ok(())
    }

    /// 写入字符串：`i32` 字节长度加 UTF-8 字节。
    pub fn write_string(&mut self, value: &str) -> Result<(), PortError> {
        let len = i32::try_from(value.len())
            .map_err(|_| PortError::configuration("string is longer than i32::MAX bytes"))?;
        if !self.byte_only {
            self.write(len)?;
        } else {
            self.write_array(&len.to_be_bytes())?;
        }
        self.write_array(value.as_bytes())
    }

    /// 把已写入的数据发出并等待写出完成，消息仍然存活。
    pub fn flush(&mut self) -> Result<(), PortError> {
        let mut writer = FrameWriter::new(&self.port, &mut self.writer);
        writer.flush();
        self.port.check_connections(self.had_connections)
    }

    /// 本条消息目前写入的有效字节数。
    pub fn bytes_written(&self) -> u64 {
        self.payload
    }

    /// 结束消息，返回写入的有效字节数。
    pub fn finish(mut self) -> Result<u64, PortError> {
        self.complete()?;
        Ok(self.payload)
    }

    fn complete(&mut self) -> Result<(), PortError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut writer = FrameWriter::new(&self.port, &mut self.writer);
        writer.flush();
        let wire_bytes = writer.wire_bytes();
        // 未发送完的缓冲（只可能是空缓冲）随状态一起回池。
        self.writer.buffer = None;
        let counters = &self.port.counters;
        counters.add(stats::MESSAGES, 1);
        counters.add(stats::MESSAGE_BYTES, self.payload);
        counters.add(stats::BYTES, wire_bytes);
        let result = self.port.check_connections(self.had_connections);
        self.port.release();
        tracing::trace!(port = %self.port.id, payload = self.payload, "message finished");
        result
    }
}

impl Drop for WriteMessage {
    fn drop(&mut self) {
        if let Err(err) = self.complete() {
            tracing::warn!(port = %self.port.id, error = %err, "implicitly finished message failed");
        }
    }
}

impl core::fmt::Debug for WriteMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteMessage")
            .field("port", &self.port.id)
            .field("payload", &self.payload)
            .field("finished", &self.finished)
            .finish()
    }
}

/// 入站消息。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一接收端口任一时刻至多一条存活的 [`ReadMessage`]，交付因此天然串行；
/// - 读取按发送方写入的类型顺序进行，类型不匹配不会被检测到，这与线格式没有类型标签一致。
///
/// ## 契约（What）
/// - [`ReadMessage::finish`] 丢弃未读内容、释放端口，之后的读取返回错误；
/// - 析构时自动结束；
/// - 读取失败（连接断开、帧非法）后消息进入失败状态，结束时拆除该连接。
pub struct ReadMessage {
    port: Arc<ReceiveShared>,
    key: ConnectionKey,
    origin: SendPortId,
    dissipator: Option<Box<Dissipator>>,
    sequence: Option<i64>,
    received_at_start: u64,
    payload: u64,
    header_read: bool,
    failure: Option<PortError>,
}

impl ReadMessage {
    pub(crate) fn new(
        port: Arc<ReceiveShared>,
        key: ConnectionKey,
        origin: SendPortId,
        dissipator: Box<Dissipator>,
    ) -> Self {
        let received_at_start = dissipator.bytes_received();
        Self {
            port,
            key,
            origin,
            dissipator: Some(dissipator),
            sequence: None,
            received_at_start,
            payload: 0,
            header_read: true,
            failure: None,
        }
    }

    /// 读取编号端口的消息序号；失败时消息进入失败状态，且不计入消息数。
    pub(crate) fn read_sequence(&mut self) -> Result<(), PortError> {
        let sequence = self
            .read_raw::<i64>()
            .inspect_err(|_| self.header_read = false)?;
        self.sequence = Some(sequence);
        Ok(())
    }

    /// 发送方端口。
    pub fn origin(&self) -> &SendPortId {
        &self.origin
    }

    /// 编号端口上的消息序号。
    pub fn sequence_number(&self) -> Option<i64> {
        self.sequence
    }

    /// 本条消息已经读出的有效字节数。
    pub fn bytes_read(&self) -> u64 {
        self.payload
    }

    /// 是否已经结束。
    pub fn is_finished(&self) -> bool {
        self.dissipator.is_none()
    }

    fn dissipator(&mut self) -> Result<&mut Dissipator, PortError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.dissipator
            .as_deref_mut()
            .ok_or_else(|| PortError::configuration("message already finished"))
    }

    fn read_raw<T: Primitive>(&mut self) -> Result<T, PortError> {
        let result = self.dissipator()?.read::<T>();
        result.inspect_err(|err| self.failure = Some(err.clone()))
    }

    /// 读取一个基本类型值。
    pub fn read<T: Primitive>(&mut self) -> Result<T, PortError> {
        let value = self.read_raw::<T>()?;
        self.payload += T::SEGMENT.width() as u64;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, PortError> {
        self.read()
    }

    pub fn read_byte(&mut self) -> Result<i8, PortError> {
        self.read()
    }

    pub fn read_char(&mut self) -> Result<u16, PortError> {
        self.read()
    }

    pub fn read_short(&mut self) -> Result<i16, PortError> {
        self.read()
    }

    pub fn read_int(&mut self) -> Result<i32, PortError> {
        self.read()
    }

    pub fn read_long(&mut self) -> Result<i64, PortError> {
        self.read()
    }

    pub fn read_float(&mut self) -> Result<f32, PortError> {
        self.read()
    }

    pub fn read_double(&mut self) -> Result<f64, PortError> {
        self.read()
    }

    /// 读满 `dst`。
    pub fn read_array<T: Primitive>(&mut self, dst: &mut [T]) -> Result<(), PortError> {
        let result = self.dissipator()?.read_slice(dst);
        if let Err(err) = &result {
            self.failure = Some(err.clone());
        }
        result?;
        self.payload += (dst.len() * T::SEGMENT.width()) as u64;
        Ok(())
    }

    /// 读取 [`WriteMessage::write_string`] 写入的字符串。
    pub fn read_string(&mut self) -> Result<String, PortError> {
        let byte_only = {
            let port_type = self.port.port_type();
            port_type.has(caps::SERIALIZATION_BYTE) && !port_type.has(caps::SERIALIZATION_DATA)
        };
        let len = if byte_only {
            let mut raw = [0u8; 4];
            self.read_array(&mut raw)?;
            i32::from_be_bytes(raw)
        } else {
            self.read::<i32>()?
        };
        let len = usize::try_from(len)
            .map_err(|_| PortError::protocol(format!("negative string length {len}")))?;
        let mut bytes = vec![0u8; len];
        self.read_array(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| {
            let err = PortError::protocol("string is not valid UTF-8");
            self.failure = Some(err.clone());
            err
        })
    }

    /// 丢弃未读内容并结束消息，返回读出的有效字节数。
    pub fn finish(&mut self) -> Result<u64, PortError> {
        if self.dissipator.is_none() {
            return Err(PortError::configuration("message already finished"));
        }
        self.complete();
        Ok(self.payload)
    }

    /// 标记失败并结束；连接随后以 `cause` 拆除。
    pub(crate) fn fail(&mut self, cause: PortError) {
        self.failure = Some(cause);
        self.complete();
    }

    fn complete(&mut self) {
        let Some(mut dissipator) = self.dissipator.take() else {
            return;
        };
        dissipator.discard_frame();
        let wire_bytes = dissipator.bytes_received() - self.received_at_start;
        UpcallScope::leave_early();
        self.port.finish_message(
            self.key,
            dissipator,
            self.failure.clone(),
            self.header_read.then_some(self.payload),
            wire_bytes,
        );
    }
}

impl Drop for ReadMessage {
    fn drop(&mut self) {
        self.complete();
    }
}

impl core::fmt::Debug for ReadMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadMessage")
            .field("origin", &self.origin)
            .field("sequence", &self.sequence)
            .field("payload", &self.payload)
            .finish()
    }
}
