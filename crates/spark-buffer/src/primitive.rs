//! 可写入帧的基本类型。
//!
//! 每种类型固定落在一个段里：`i64 → LONGS`、`f64 → DOUBLES`、`i32 → INTS`、
//! `f32 → FLOATS`、`i16 → SHORTS`、`u16 → CHARS`（UTF-16 代码单元），
//! `i8`/`u8`/`bool → BYTES`。

use bytes::BufMut;

use crate::{ByteOrder, Segment};

mod sealed {
    pub trait Sealed {}
}

/// 可按段编码的基本类型。
///
/// # 契约（What）
/// - `SEGMENT`：值所属的段，`SEGMENT.width()` 即编码宽度；
/// - `encode`：按给定字节序追加到段尾；
/// - `decode`：从恰好 `width` 字节的切片还原；调用方保证长度。
///
/// 该 trait 已密封，段映射属于线格式，不允许下游扩展。
pub trait Primitive: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    /// 值所属的段。
    const SEGMENT: Segment;

    /// 追加编码后的字节。
    fn encode<B: BufMut>(self, dst: &mut B, order: ByteOrder);

    /// 从 `src` 解码一个值。
    fn decode(src: &[u8], order: ByteOrder) -> Self;
}

macro_rules! impl_numeric {
    ($($ty:ty => $segment:ident, $width:literal;)*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SEGMENT: Segment = Segment::$segment;

                fn encode<B: BufMut>(self, dst: &mut B, order: ByteOrder) {
                    match order {
                        ByteOrder::Big => dst.put_slice(&self.to_be_bytes()),
                        ByteOrder::Little => dst.put_slice(&self.to_le_bytes()),
                    }
                }

                fn decode(src: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; $width];
                    raw.copy_from_slice(&src[..$width]);
                    match order {
                        ByteOrder::Big => <$ty>::from_be_bytes(raw),
                        ByteOrder::Little => <$ty>::from_le_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_numeric! {
    i64 => Longs, 8;
    f64 => Doubles, 8;
    i32 => Ints, 4;
    f32 => Floats, 4;
    i16 => Shorts, 2;
    u16 => Chars, 2;
    i8 => Bytes, 1;
    u8 => Bytes, 1;
}

impl sealed::Sealed for bool {}

impl Primitive for bool {
    const SEGMENT: Segment = Segment::Bytes;

    fn encode<B: BufMut>(self, dst: &mut B, _order: ByteOrder) {
        dst.put_u8(u8::from(self));
    }

    fn decode(src: &[u8], _order: ByteOrder) -> Self {
        src[0] != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Primitive + PartialEq + core::fmt::Debug>(value: T) {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let mut buf = Vec::new();
            value.encode(&mut buf, order);
            assert_eq!(buf.len(), T::SEGMENT.width());
            assert_eq!(T::decode(&buf, order), value);
        }
    }

    #[test]
    fn every_primitive_survives_both_orders() {
        round_trip(-42i64);
        round_trip(6.25f64);
        round_trip(42i32);
        round_trip(-1.5f32);
        round_trip(-7i16);
        round_trip(0x4e2du16);
        round_trip(-3i8);
        round_trip(200u8);
        round_trip(true);
        round_trip(false);
    }

    #[test]
    fn big_endian_int_layout() {
        let mut buf = Vec::new();
        0x0102_0304i32.encode(&mut buf, ByteOrder::Big);
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
