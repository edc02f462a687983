//! # dissipator 模块说明
//!
//! ## 角色定位（Why）
//! - 每条入站连接对应一个 [`Dissipator`]：把字节流还原为帧头加七个类型段的视图；
//! - 接收端口借助 [`Dissipator::next_event`] 以不阻塞的方式判断“是否有完整消息在等待”。
//!
//! ## 执行逻辑（How）
//! 1. 先凑齐 16 字节帧头并校验，再凑齐帧头声明的全部字节，整帧在环形缓冲中占用；
//! 2. 类型读取在对应段耗尽时自动接收下一帧，上一帧剩余内容随之丢弃；
//! 3. 控制字节位于 BYTES 段：`NEW_RECEIVER` 跳过，`NEW_MESSAGE` 报告新消息，
//!    两种关闭控制报告连接结束（`CLOSE_ONE_CONNECTION` 仅在目标是本端口时生效）。
//!
//! ## 契约（What）
//! - 帧只有完整到达后才被解读，半帧永远不会递交；
//! - EOF 与 IO 错误都以 [`PortError::Io`] 报告，由端口走连接丢失路径；
//! - 帧头非法与未知控制字节以 [`PortError::Protocol`] 报告。

mod ring;
mod source;

use std::io;

use bytes::Bytes;
use spark_buffer::{
    ByteOrder, FrameHeader, Primitive, Segment,
    frame::{HEADER_LEN, SEGMENT_COUNT},
};

pub(crate) use source::{BlockingSource, ByteSource, QueueSource, Wait, pump};
use source::Fill;

use crate::{
    PortError,
    protocol::{CLOSE_ALL_CONNECTIONS, CLOSE_ONE_CONNECTION, NEW_MESSAGE, NEW_RECEIVER},
    wire::MAX_FIELD_LEN,
};
use ring::RingBuffer;

/// 连接上的下一个事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// 一条新消息已经就绪，接下来的读取属于它。
    NewMessage,
    /// 发送方结束了这条连接。
    Closed,
    /// 暂无完整控制字节（仅 `Wait::NoWait`）。
    Pending,
}

struct ActiveFrame {
    order: ByteOrder,
    cursor: [usize; SEGMENT_COUNT],
    end: [usize; SEGMENT_COUNT],
}

impl ActiveFrame {
    fn new(header: &FrameHeader, start: usize) -> Self {
        let mut cursor = [0; SEGMENT_COUNT];
        let mut end = [0; SEGMENT_COUNT];
        let mut offset = start + HEADER_LEN;
        for segment in Segment::ALL {
            let index = segment.index();
            cursor[index] = offset;
            offset += usize::from(header.lengths[index]);
            end[index] = offset;
        }
        Self { order: header.order, cursor, end }
    }

    fn remaining(&self, segment: Segment) -> usize {
        self.end[segment.index()] - self.cursor[segment.index()]
    }
}

/// 单条入站连接的解帧器。
pub(crate) struct Dissipator {
    source: Box<dyn ByteSource>,
    ring: RingBuffer,
    frame: Option<ActiveFrame>,
    own_id: Bytes,
    bytes_received: u64,
}

impl Dissipator {
    pub(crate) fn new(source: Box<dyn ByteSource>, ring_capacity: usize, own_id: Bytes) -> Self {
        Self {
            source,
            ring: RingBuffer::new(ring_capacity),
            frame: None,
            own_id,
            bytes_received: 0,
        }
    }

    /// 迄今从通道收到的字节数。
    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// 丢弃当前帧剩余的内容。
    pub(crate) fn discard_frame(&mut self) {
        if self.frame.take().is_some() {
            self.ring.release();
        }
    }

    fn ensure(&mut self, needed: usize, wait: Wait) -> Result<bool, PortError> {
        while self.ring.unclaimed() < needed {
            let spare = self.ring.spare_mut();
            match self.source.fill(spare, wait) {
                Ok(Fill::Data(read)) => {
                    self.ring.commit(read);
                    self.bytes_received += read as u64;
                }
                Ok(Fill::Pending) => return Ok(false),
                Ok(Fill::Eof) => {
                    return Err(PortError::io(
                        "receive frame",
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "channel closed without a close opcode",
                        ),
                    ));
                }
                Err(err) => return Err(PortError::io("receive frame", err)),
            }
        }
        Ok(true)
    }

    /// 接收下一帧；`NoWait` 下数据不全时返回 `false` 且不消费任何字节。
    fn receive_frame(&mut self, wait: Wait) -> Result<bool, PortError> {
        self.discard_frame();
        if !self.ensure(HEADER_LEN, wait)? {
            return Ok(false);
        }
        let mut raw = [0u8; HEADER_LEN];
        self.ring.peek(&mut raw);
        let header = FrameHeader::decode(&raw)
            .map_err(|err| PortError::protocol(format!("invalid frame header: {err}")))?;
        let frame_len = header.frame_len();
        if !self.ensure(frame_len, wait)? {
            return Ok(false);
        }
        let start = self.ring.claim(frame_len);
        tracing::trace!(frame_len, order = ?header.order, "frame received");
        self.frame = Some(ActiveFrame::new(&header, start));
        Ok(true)
    }

    /// 确保当前帧的 `segment` 至少还有 `width` 字节。
    fn ready(&mut self, segment: Segment, wait: Wait) -> Result<bool, PortError> {
        loop {
            if let Some(frame) = &self.frame
                && frame.remaining(segment) >= segment.width()
            {
                return Ok(true);
            }
            if !self.receive_frame(wait)? {
                return Ok(false);
            }
        }
    }

    fn take<T: Primitive>(&mut self) -> Option<T> {
        let frame = self.frame.as_mut()?;
        let index = T::SEGMENT.index();
        let width = T::SEGMENT.width();
        let at = frame.cursor[index];
        frame.cursor[index] += width;
        Some(T::decode(self.ring.bytes(at, width), frame.order))
    }

    /// 读取下一个 `T`，段耗尽时阻塞接收下一帧。
    pub(crate) fn read<T: Primitive>(&mut self) -> Result<T, PortError> {
        self.ready(T::SEGMENT, Wait::Block)?;
        self.take::<T>()
            .ok_or_else(|| PortError::protocol("frame vanished while reading"))
    }

    /// 读满 `dst`，可以跨越多帧。
    pub(crate) fn read_slice<T: Primitive>(&mut self, dst: &mut [T]) -> Result<(), PortError> {
        let width = T::SEGMENT.width();
        let mut filled = 0;
        while filled < dst.len() {
            self.ready(T::SEGMENT, Wait::Block)?;
            let available = self
                .frame
                .as_ref()
                .map_or(0, |frame| frame.remaining(T::SEGMENT) / width);
            let count = available.min(dst.len() - filled);
            for slot in &mut dst[filled..filled + count] {
                if let Some(value) = self.take::<T>() {
                    *slot = value;
                }
            }
            filled += count;
        }
        Ok(())
    }

    fn read_control(&mut self, wait: Wait) -> Result<Option<u8>, PortError> {
        if !self.ready(Segment::Bytes, wait)? {
            return Ok(None);
        }
        Ok(self.take::<u8>())
    }

    /// 判断连接上的下一个事件；`NoWait` 时从不阻塞。
    pub(crate) fn next_event(&mut self, wait: Wait) -> Result<Inbound, PortError> {
        loop {
            let Some(opcode) = self.read_control(wait)? else {
                return Ok(Inbound::Pending);
            };
            match opcode {
                NEW_RECEIVER => continue,
                NEW_MESSAGE => return Ok(Inbound::NewMessage),
                CLOSE_ALL_CONNECTIONS => return Ok(Inbound::Closed),
                CLOSE_ONE_CONNECTION => {
                    let mut len = [0u8; 4];
                    self.read_slice(&mut len)?;
                    let len = u32::from_be_bytes(len) as usize;
                    if len > MAX_FIELD_LEN {
                        return Err(PortError::protocol(format!(
                            "close target of {len} bytes exceeds the limit"
                        )));
                    }
                    let mut target = vec![0u8; len];
                    self.read_slice(&mut target)?;
                    if target == self.own_id.as_ref() {
                        return Ok(Inbound::Closed);
                    }
                    tracing::trace!("close request addressed to another receiver skipped");
                }
                other => {
                    return Err(PortError::protocol(format!("unknown control opcode {other}")));
                }
            }
        }
    }
}

impl Drop for Dissipator {
    fn drop(&mut self) {
        self.discard_frame();
    }
}
