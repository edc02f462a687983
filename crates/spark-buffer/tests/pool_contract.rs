//! `pool_contract` 集成测试：以外部 crate 视角验证发送缓冲池的租借、翻转与回收契约。
//!
//! # 测试目标（Why）
//! - 多连接扇出时，副本租约可能在不同线程、不同时刻释放，存储必须恰好回收一次；
//! - 帧长度对 8 取模为零是接收端环形缓冲的前提，任意段长度组合都必须满足。
//!
//! # 结构安排（How）
//! - `replicas_released_across_threads_recycle_once`：并发释放副本后统计一致；
//! - `padding_invariant_holds_for_any_segment_mix`：`proptest` 覆盖段长度组合；
//! - `interleaved_writes_preserve_per_segment_order`：按类型分段后各段内部保持程序顺序。

use std::thread;

use proptest::prelude::*;
use spark_buffer::{
    ByteOrder, FrameHeader, PoolConfig, Segment, SendBufferPool,
    frame::{FRAME_ALIGNMENT, HEADER_LEN},
};

fn pool_with(segment_capacity: usize) -> SendBufferPool {
    SendBufferPool::new(PoolConfig {
        segment_capacity,
        cache_size: 8,
        byte_order: ByteOrder::Little,
    })
}

/// 验证副本在多个线程中释放时，存储只回收一次且统计归零。
#[test]
fn replicas_released_across_threads_recycle_once() {
    let pool = pool_with(64);
    for round in 0..16 {
        let mut buffer = pool.acquire();
        buffer.write(round as i64).expect("写入失败");
        let original = buffer.flip();
        let replicas = original.replicate(4);
        let handles: Vec<_> = replicas
            .into_iter()
            .map(|lease| thread::spawn(move || lease.len()))
            .collect();
        drop(original);
        for handle in handles {
            assert_eq!(handle.join().expect("线程异常退出") % FRAME_ALIGNMENT, 0);
        }
    }
    let stats = pool.stats();
    assert_eq!(stats.frames_in_flight, 0);
    assert_eq!(stats.recycled_frames, 16);
    assert_eq!(stats.replicas_issued, 64);
    assert_eq!(stats.allocated_storages, 1);
}

/// 验证同一段内部的值保持写入顺序，不同段之间互不干扰。
#[test]
fn interleaved_writes_preserve_per_segment_order() {
    let pool = pool_with(64);
    let mut buffer = pool.acquire();
    buffer.write(1i32).expect("写入失败");
    buffer.write(10u8).expect("写入失败");
    buffer.write(2i32).expect("写入失败");
    buffer.write(11u8).expect("写入失败");
    let lease = buffer.flip();
    assert_eq!(lease.segment_len(Segment::Ints), 8);
    assert_eq!(lease.segment_len(Segment::Bytes), 2);

    let bytes = lease.to_vec();
    let ints = &bytes[HEADER_LEN..HEADER_LEN + 8];
    assert_eq!(ints, [1, 0, 0, 0, 2, 0, 0, 0]);
    assert_eq!(&bytes[HEADER_LEN + 8..HEADER_LEN + 10], &[10, 11]);
}

proptest! {
    /// 任意段长度组合下，翻转后的整帧长度都是 8 的倍数，且帧头可以无损解码。
    #[test]
    fn padding_invariant_holds_for_any_segment_mix(
        longs in 0usize..6,
        doubles in 0usize..6,
        ints in 0usize..9,
        floats in 0usize..9,
        shorts in 0usize..17,
        chars in 0usize..17,
        bytes in 0usize..33,
    ) {
        let pool = pool_with(64);
        let mut buffer = pool.acquire();
        prop_assert_eq!(buffer.write_slice(&vec![7i64; longs]), longs);
        prop_assert_eq!(buffer.write_slice(&vec![0.5f64; doubles]), doubles);
        prop_assert_eq!(buffer.write_slice(&vec![3i32; ints]), ints);
        prop_assert_eq!(buffer.write_slice(&vec![1.5f32; floats]), floats);
        prop_assert_eq!(buffer.write_slice(&vec![-2i16; shorts]), shorts);
        prop_assert_eq!(buffer.write_slice(&vec![0x41u16; chars]), chars);
        prop_assert_eq!(buffer.write_slice(&vec![9u8; bytes]), bytes);

        let lease = buffer.flip();
        let raw = lease.to_vec();
        prop_assert_eq!(raw.len() % FRAME_ALIGNMENT, 0);

        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&raw[..HEADER_LEN]);
        let header = FrameHeader::decode(&head).expect("帧头必须可解码");
        prop_assert_eq!(header.frame_len(), raw.len());
        prop_assert!(header.padding < 8);
    }
}
