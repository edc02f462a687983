//! 带溢出区的环形接收缓冲。
//!
//! 帧在环尾折返时，把折返部分复制到紧随环尾的溢出区，使整帧在内存中连续，
//! 各类型段因此都是普通切片。溢出区大小等于一帧的上限。

use spark_buffer::frame::MAX_FRAME_LEN;

pub(crate) struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
    head: usize,
    filled: usize,
    in_use: usize,
}

impl RingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FRAME_LEN);
        Self {
            data: vec![0; capacity + MAX_FRAME_LEN],
            capacity,
            head: 0,
            filled: 0,
            in_use: 0,
        }
    }

    /// 尚未被当前帧占用的已接收字节数。
    pub(crate) fn unclaimed(&self) -> usize {
        self.filled - self.in_use
    }

    /// 下一段可写入的连续空闲区域。
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        if self.filled == 0 {
            self.head = 0;
        }
        if self.filled == self.capacity {
            return &mut [];
        }
        let tail = self.head + self.filled;
        if tail < self.capacity {
            &mut self.data[tail..self.capacity]
        } else {
            let tail = tail - self.capacity;
            &mut self.data[tail..self.head]
        }
    }

    pub(crate) fn commit(&mut self, len: usize) {
        debug_assert!(self.filled + len <= self.capacity);
        self.filled += len;
    }

    /// 把未占用数据的前 `dst.len()` 字节复制出来，不消费。
    pub(crate) fn peek(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.unclaimed());
        let start = (self.head + self.in_use) % self.capacity;
        let first = dst.len().min(self.capacity - start);
        dst[..first].copy_from_slice(&self.data[start..start + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.data[..rest]);
    }

    /// 占用接下来的 `len` 字节作为当前帧，返回其在 [`Self::bytes`] 中的起点。
    pub(crate) fn claim(&mut self, len: usize) -> usize {
        debug_assert_eq!(self.in_use, 0);
        debug_assert!(len <= self.filled && len <= MAX_FRAME_LEN);
        let end = self.head + len;
        if end > self.capacity {
            let wrapped = end - self.capacity;
            self.data.copy_within(..wrapped, self.capacity);
        }
        self.in_use = len;
        self.head
    }

    /// 释放当前帧。
    pub(crate) fn release(&mut self) {
        self.head = (self.head + self.in_use) % self.capacity;
        self.filled -= self.in_use;
        self.in_use = 0;
    }

    pub(crate) fn bytes(&self, start: usize, len: usize) -> &[u8] {
        &self.data[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(ring: &mut RingBuffer, mut src: &[u8]) {
        while !src.is_empty() {
            let spare = ring.spare_mut();
            let n = spare.len().min(src.len());
            assert!(n > 0, "环形缓冲不应在此处写满");
            spare[..n].copy_from_slice(&src[..n]);
            ring.commit(n);
            src = &src[n..];
        }
    }

    #[test]
    fn wrapped_frame_is_contiguous() {
        let mut ring = RingBuffer::new(0);
        let cap = ring.capacity;
        // 填充物之后紧跟帧的前 8 字节，释放填充物后帧剩余部分折返到环首。
        let frame: Vec<u8> = (0..32u8).collect();
        let mut first = vec![0xAA; cap - 16];
        first.extend_from_slice(&frame[..8]);
        push(&mut ring, &first);
        let _ = ring.claim(cap - 16);
        ring.release();
        push(&mut ring, &frame[8..]);
        assert_eq!(ring.unclaimed(), 32);
        let mut header = [0u8; 16];
        ring.peek(&mut header);
        assert_eq!(&header[..], &frame[..16]);

        let start = ring.claim(32);
        assert_eq!(start, cap - 16);
        assert_eq!(ring.bytes(start, 32), &frame[..]);
        ring.release();
        assert_eq!(ring.unclaimed(), 0);
    }
}
