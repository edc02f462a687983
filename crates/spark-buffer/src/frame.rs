//! 帧格式：16 字节帧头 + 7 个类型段 + 填充。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 收发双方从不交换模式信息，段的固定顺序本身就是线格式的一部分；
//! - 帧头携带发送方字节序，接收方逐帧决定是否翻转。
//!
//! ## 契约（What）
//! - 字节 0：字节序标志，1 表示大端，0 表示小端；
//! - 字节 1：填充长度（0..=7）；
//! - 字节 2..16：7 个 16 位段长度，按发送方字节序编码，顺序为
//!   LONGS, DOUBLES, INTS, FLOATS, SHORTS, CHARS, BYTES；
//! - 帧体依次为 7 个段，之后是填充字节，使 `帧头 + 帧体 + 填充 ≡ 0 (mod 8)`。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 帧头长度（字节）。
pub const HEADER_LEN: usize = 16;
/// 帧长度的对齐粒度。
pub const FRAME_ALIGNMENT: usize = 8;
/// 类型段数量。
pub const SEGMENT_COUNT: usize = 7;
/// 单段可声明的最大字节数（受 16 位长度字段约束，并向下对齐到 8）。
pub const MAX_SEGMENT_LEN: usize = (u16::MAX as usize) & !(FRAME_ALIGNMENT - 1);
/// 线格式允许的最大帧长度。
pub const MAX_FRAME_LEN: usize =
    HEADER_LEN + SEGMENT_COUNT * u16::MAX as usize + (FRAME_ALIGNMENT - 1);

/// 类型段，按线格式顺序排列。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Longs = 0,
    Doubles = 1,
    Ints = 2,
    Floats = 3,
    Shorts = 4,
    Chars = 5,
    Bytes = 6,
}

impl Segment {
    /// 线格式顺序下的全部段。
    pub const ALL: [Segment; SEGMENT_COUNT] = [
        Segment::Longs,
        Segment::Doubles,
        Segment::Ints,
        Segment::Floats,
        Segment::Shorts,
        Segment::Chars,
        Segment::Bytes,
    ];

    /// 段内单个元素的宽度。
    pub const fn width(self) -> usize {
        match self {
            Segment::Longs | Segment::Doubles => 8,
            Segment::Ints | Segment::Floats => 4,
            Segment::Shorts | Segment::Chars => 2,
            Segment::Bytes => 1,
        }
    }

    /// 段在帧头与段数组中的下标。
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// 多字节值的编码顺序。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// 当前平台的原生字节序。
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// 帧头中的标志值。
    pub const fn flag(self) -> u8 {
        match self {
            ByteOrder::Big => 1,
            ByteOrder::Little => 0,
        }
    }

    /// 从帧头标志还原字节序。
    pub fn from_flag(flag: u8) -> Result<Self, FrameError> {
        match flag {
            1 => Ok(ByteOrder::Big),
            0 => Ok(ByteOrder::Little),
            other => Err(FrameError::InvalidByteOrder(other)),
        }
    }

    fn put_u16(self, dst: &mut [u8], value: u16) {
        let raw = match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        };
        dst.copy_from_slice(&raw);
    }

    fn get_u16(self, src: &[u8]) -> u16 {
        let raw = [src[0], src[1]];
        match self {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        }
    }
}

/// 帧头解码或校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// 字节序标志既不是 0 也不是 1。
    #[error("invalid byte order flag {0}")]
    InvalidByteOrder(u8),

    /// 填充长度与帧体长度不匹配。
    #[error("padding {padding} does not align a {payload}-byte payload to {FRAME_ALIGNMENT} bytes")]
    InvalidPadding { padding: u8, payload: usize },

    /// 段长度不是元素宽度的整数倍。
    #[error("segment {segment:?} declares {len} bytes, not a multiple of {width}")]
    MisalignedSegment {
        segment: Segment,
        len: usize,
        width: usize,
    },
}

/// 解码后的帧头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub order: ByteOrder,
    pub padding: u8,
    pub lengths: [u16; SEGMENT_COUNT],
}

impl FrameHeader {
    /// 根据段长度构造帧头，并计算填充。
    pub fn new(order: ByteOrder, lengths: [u16; SEGMENT_COUNT]) -> Self {
        let payload: usize = lengths.iter().map(|len| *len as usize).sum();
        Self {
            order,
            padding: padding_for(HEADER_LEN + payload) as u8,
            lengths,
        }
    }

    /// 帧体（不含帧头与填充）长度。
    pub fn payload_len(&self) -> usize {
        self.lengths.iter().map(|len| *len as usize).sum()
    }

    /// 整帧长度。
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len() + self.padding as usize
    }

    /// 编码为 16 字节。
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.order.flag();
        out[1] = self.padding;
        for (index, len) in self.lengths.iter().enumerate() {
            let at = 2 + index * 2;
            self.order.put_u16(&mut out[at..at + 2], *len);
        }
        out
    }

    /// 解码并校验帧头。
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let order = ByteOrder::from_flag(raw[0])?;
        let padding = raw[1];
        let mut lengths = [0u16; SEGMENT_COUNT];
        for (index, segment) in Segment::ALL.iter().enumerate() {
            let at = 2 + index * 2;
            let len = order.get_u16(&raw[at..at + 2]);
            if len as usize % segment.width() != 0 {
                return Err(FrameError::MisalignedSegment {
                    segment: *segment,
                    len: len as usize,
                    width: segment.width(),
                });
            }
            lengths[index] = len;
        }
        let header = Self {
            order,
            padding,
            lengths,
        };
        let payload = header.payload_len();
        if padding as usize >= FRAME_ALIGNMENT || header.frame_len() % FRAME_ALIGNMENT != 0 {
            return Err(FrameError::InvalidPadding { padding, payload });
        }
        Ok(header)
    }
}

/// 把 `len` 补齐到 8 的倍数所需的填充字节数（0..=7）。
pub const fn padding_for(len: usize) -> usize {
    (FRAME_ALIGNMENT - len % FRAME_ALIGNMENT) % FRAME_ALIGNMENT
}
