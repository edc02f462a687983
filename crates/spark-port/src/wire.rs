//! 标识、能力集合与握手共用的长度前缀编码。
//!
//! 所有整数均为大端；变长字段以 4 字节长度开头。解码从不返回部分结果。

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// 单个变长字段允许的最大长度，防止损坏的长度字段触发巨量分配。
pub(crate) const MAX_FIELD_LEN: usize = 1 << 20;

/// 字节流无法还原为目标结构。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// 数据在字段结束前耗尽。
    #[error("truncated input: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// 长度字段超过上限。
    #[error("field length {0} exceeds the {MAX_FIELD_LEN}-byte limit")]
    FieldTooLong(usize),

    /// 文本字段不是合法的 UTF-8。
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,

    /// 结构解码完毕后仍有多余字节。
    #[error("{0} trailing bytes after the encoded value")]
    TrailingBytes(usize),
}

pub(crate) fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

pub(crate) fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

/// 游标式读取器。
pub(crate) struct Reader<'a> {
    src: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(src: &'a [u8]) -> Self {
        Self { src }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.src.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: self.src.len(),
            });
        }
        let (head, tail) = self.src.split_at(len);
        self.src = tail;
        Ok(head)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(DecodeError::FieldTooLong(len));
        }
        self.take(len)
    }

    pub(crate) fn str(&mut self) -> Result<&'a str, DecodeError> {
        core::str::from_utf8(self.bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        if self.src.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.src.len()))
        }
    }
}
