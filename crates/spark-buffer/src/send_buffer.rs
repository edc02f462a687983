use std::sync::Arc;

use thiserror::Error;

use crate::{
    ByteOrder, FrameHeader, Primitive, Segment,
    frame::{HEADER_LEN, SEGMENT_COUNT},
    pool::{FrameStorage, PoolInner},
};

/// 填充字节的来源，内容无意义，只取长度。
static PADDING: [u8; 8] = [0; 8];

/// 写入的段已经没有空间。
///
/// 这不是故障而是显式的冲刷点：调用方应当发送当前缓冲、换一个新缓冲，
/// 然后重试溢出的那一次写入。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("segment {segment:?} of the send buffer is full")]
pub struct BufferFull {
    pub segment: Segment,
}

/// 处于写入阶段的发送缓冲。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把程序顺序中的基本类型值按宽度分拣进 7 个段，接收端按同样的类型顺序读取即可还原；
/// - 段容量固定，溢出时返回 [`BufferFull`] 而不是扩容，单帧内存有上界，背压也因此变成
///   显式的冲刷点。
///
/// ## 契约（What）
/// - `write`：追加单个值，段满时返回 `Err(BufferFull)` 且缓冲内容不变；
/// - `write_slice`：尽量多地追加，返回实际写入的元素个数；
/// - `flip`：消耗缓冲，计算帧头与填充，产出只读的 [`FrameLease`]；每个缓冲恰好翻转一次，
///   由所有权在类型层面保证；
/// - 未翻转即丢弃时，段存储自动回到池中。
pub struct SendBuffer {
    pool: Arc<PoolInner>,
    slot: usize,
    storage: FrameStorage,
    released: bool,
}

impl SendBuffer {
    pub(crate) fn new(pool: Arc<PoolInner>, slot: usize, storage: FrameStorage) -> Self {
        Self {
            pool,
            slot,
            storage,
            released: false,
        }
    }

    /// 写入使用的字节序。
    pub fn byte_order(&self) -> ByteOrder {
        self.pool.config.byte_order
    }

    /// 单段容量。
    pub fn segment_capacity(&self) -> usize {
        self.pool.config.segment_capacity
    }

    /// 某个段的剩余字节数。
    pub fn remaining(&self, segment: Segment) -> usize {
        self.segment_capacity()
            .saturating_sub(self.storage.segments[segment.index()].len())
    }

    /// 追加单个值。
    pub fn write<T: Primitive>(&mut self, value: T) -> Result<(), BufferFull> {
        let segment = T::SEGMENT;
        if self.remaining(segment) < segment.width() {
            return Err(BufferFull { segment });
        }
        let order = self.byte_order();
        value.encode(&mut self.storage.segments[segment.index()], order);
        Ok(())
    }

    /// 追加尽可能多的值，返回写入的个数。
    pub fn write_slice<T: Primitive>(&mut self, values: &[T]) -> usize {
        let segment = T::SEGMENT;
        let fit = (self.remaining(segment) / segment.width()).min(values.len());
        let order = self.byte_order();
        let dst = &mut self.storage.segments[segment.index()];
        for &value in &values[..fit] {
            value.encode(dst, order);
        }
        fit
    }

    /// 已写入的段字节总数。
    pub fn len(&self) -> usize {
        self.storage.segments.iter().map(|segment| segment.len()).sum()
    }

    /// 是否尚未写入任何值。
    pub fn is_empty(&self) -> bool {
        self.storage.segments.iter().all(|segment| segment.is_empty())
    }

    /// 计算帧头并冻结为只读帧。
    pub fn flip(mut self) -> FrameLease {
        let storage = core::mem::take(&mut self.storage);
        self.released = true;

        let mut lengths = [0u16; SEGMENT_COUNT];
        for (len, segment) in lengths.iter_mut().zip(storage.segments.iter()) {
            // 段容量已被规整到 16 位以内。
            *len = u16::try_from(segment.len()).unwrap_or(u16::MAX);
        }
        let header = FrameHeader::new(self.byte_order(), lengths);
        let sequence = self.pool.freeze(self.slot);
        let frame = FrozenFrame {
            header: header.encode(),
            padding: header.padding as usize,
            len: header.frame_len(),
            sequence,
            storage,
        };
        FrameLease {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
            frame: Some(Arc::new(frame)),
            replica: false,
        }
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if !self.released {
            let storage = core::mem::take(&mut self.storage);
            self.pool.discard_writing(self.slot, storage);
        }
    }
}

impl core::fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}

/// 翻转后的帧内容，由原始租约与全部副本共享。
pub(crate) struct FrozenFrame {
    header: [u8; HEADER_LEN],
    padding: usize,
    len: usize,
    sequence: u64,
    pub(crate) storage: FrameStorage,
}

/// 一份只读帧的租约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 一帧需要同时写往多条连接时，每条连接持有一个副本租约，谁先写完谁先释放；
/// - 只有最后一个租约释放时，段存储才回到池中，写得慢的连接不会读到被复用的内存。
///
/// ## 契约（What）
/// - `replicate(n)`：签发 `n` 个副本，与原始租约共享存储；
/// - `chunks`：按线格式顺序返回帧头、7 个段与填充，可直接交给矢量写；
/// - `into_writable`：当前租约是唯一持有者时解冻为新的空缓冲，避免一次池往返；
///   否则原样返回；
/// - 释放（`Drop`）恰好发生一次，由所有权保证。
pub struct FrameLease {
    pool: Arc<PoolInner>,
    slot: usize,
    frame: Option<Arc<FrozenFrame>>,
    replica: bool,
}

impl FrameLease {
    /// 整帧长度（帧头 + 段 + 填充）。
    pub fn len(&self) -> usize {
        self.frame.as_ref().map_or(0, |frame| frame.len)
    }

    /// 帧至少包含帧头，因此永远不为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 池内单调递增的帧序号，仅用于诊断。
    pub fn sequence(&self) -> u64 {
        self.frame.as_ref().map_or(0, |frame| frame.sequence)
    }

    /// 是否为副本租约。
    pub fn is_replica(&self) -> bool {
        self.replica
    }

    /// 帧头中声明的段长度。
    pub fn segment_len(&self, segment: Segment) -> usize {
        self.frame
            .as_ref()
            .map_or(0, |frame| frame.storage.segments[segment.index()].len())
    }

    /// 按线格式顺序返回帧的全部片段。
    pub fn chunks(&self) -> Vec<&[u8]> {
        let Some(frame) = self.frame.as_deref() else {
            return Vec::new();
        };
        let mut chunks = Vec::with_capacity(SEGMENT_COUNT + 2);
        chunks.push(&frame.header[..]);
        chunks.extend(frame.storage.segments.iter().map(|segment| &segment[..]));
        chunks.push(&PADDING[..frame.padding]);
        chunks
    }

    /// 把整帧拷贝为连续字节。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// 签发 `count` 个共享同一存储的副本。
    pub fn replicate(&self, count: usize) -> Vec<FrameLease> {
        let Some(frame) = self.frame.as_ref() else {
            return Vec::new();
        };
        self.pool
            .replicate(self.slot, frame, count)
            .into_iter()
            .map(|frame| FrameLease {
                pool: Arc::clone(&self.pool),
                slot: self.slot,
                frame: Some(frame),
                replica: true,
            })
            .collect()
    }

    /// 若没有其它租约存活，解冻为空的可写缓冲。
    pub fn into_writable(mut self) -> Result<SendBuffer, FrameLease> {
        let Some(frame) = self.frame.take() else {
            return Err(self);
        };
        match self.pool.thaw(self.slot, frame) {
            Ok(storage) => Ok(SendBuffer::new(Arc::clone(&self.pool), self.slot, storage)),
            Err(frame) => {
                self.frame = Some(frame);
                Err(self)
            }
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.release(self.slot, frame);
        }
    }
}

impl core::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameLease")
            .field("slot", &self.slot)
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .field("replica", &self.replica)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{PoolConfig, SendBufferPool, frame::FRAME_ALIGNMENT};

    use super::*;

    fn small_pool() -> SendBufferPool {
        SendBufferPool::new(PoolConfig {
            segment_capacity: 16,
            cache_size: 4,
            byte_order: ByteOrder::Big,
        })
    }

    #[test]
    fn overflow_reports_full_without_growing() {
        let pool = small_pool();
        let mut buffer = pool.acquire();
        buffer.write(1i64).expect("首个 long 应写入成功");
        buffer.write(2i64).expect("第二个 long 应写入成功");
        assert_eq!(
            buffer.write(3i64),
            Err(BufferFull {
                segment: Segment::Longs
            })
        );
        assert_eq!(buffer.len(), 16);
        // 其它段不受影响。
        buffer.write(9u8).expect("字节段仍有空间");
    }

    #[test]
    fn write_slice_stops_at_capacity() {
        let pool = small_pool();
        let mut buffer = pool.acquire();
        let written = buffer.write_slice(&[1i32, 2, 3, 4, 5, 6]);
        assert_eq!(written, 4);
        assert_eq!(buffer.remaining(Segment::Ints), 0);
    }

    #[test]
    fn flipped_frame_is_aligned_and_ordered() {
        let pool = small_pool();
        let mut buffer = pool.acquire();
        buffer.write(42i32).expect("写入 int 失败");
        buffer.write_slice(&[1u8, 2, 3]);
        let lease = buffer.flip();

        let bytes = lease.to_vec();
        assert_eq!(bytes.len() % FRAME_ALIGNMENT, 0);
        assert_eq!(bytes.len(), lease.len());
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = FrameHeader::decode(&raw).expect("帧头解码失败");
        assert_eq!(header.lengths, [0, 0, 4, 0, 0, 0, 3]);
        assert_eq!(&bytes[16..20], &42i32.to_be_bytes());
        assert_eq!(&bytes[20..23], &[1, 2, 3]);
    }

    #[test]
    fn storage_returns_only_after_last_replica() {
        let pool = small_pool();
        let mut buffer = pool.acquire();
        buffer.write(5i16).expect("写入失败");
        let original = buffer.flip();
        let replicas = original.replicate(2);
        assert!(replicas.iter().all(FrameLease::is_replica));

        drop(original);
        assert_eq!(pool.stats().frames_in_flight, 1);
        let mut replicas = replicas.into_iter();
        drop(replicas.next());
        assert_eq!(pool.stats().free_slots, 0);
        drop(replicas.next());

        let stats = pool.stats();
        assert_eq!(stats.frames_in_flight, 0);
        assert_eq!(stats.free_slots, 1);
        assert_eq!(stats.recycled_frames, 1);
    }

    #[test]
    fn sole_lease_thaws_into_a_clean_buffer() {
        let pool = small_pool();
        let mut buffer = pool.acquire();
        buffer.write(true).expect("写入失败");
        let lease = buffer.flip();

        let replica = lease.replicate(1);
        let lease = lease
            .into_writable()
            .err()
            .expect("存在副本时不得解冻");
        drop(replica);

        let reused = lease.into_writable().expect("唯一租约应当可以解冻");
        assert!(reused.is_empty());
        assert_eq!(pool.stats().allocated_storages, 1);
    }
}
