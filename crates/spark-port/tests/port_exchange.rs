//! `port_exchange` 集成测试：单连接上的消息交换语义。
//!
//! # 测试目标（Why）
//! - 类型化写入按程序顺序到达，字符串与数组可跨帧；
//! - 超时接收可区分且不吞掉随后到达的消息；
//! - 编号端口的序号按发送端口名单调递增；
//! - 管理计数器反映消息与字节。

mod common;

use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use common::{PATIENCE, context, context_with, init_tracing, port_type};
use spark_port::{
    MemoryNetwork, PortError, ReceivePort, SendPort, TransportConfig, TransportContext, caps,
    stats,
};

struct Pair {
    _receiver_context: TransportContext,
    _sender_context: TransportContext,
    receive: ReceivePort,
    send: SendPort,
}

fn connected_pair(config: TransportConfig, extra: &[&str]) -> Pair {
    let network = MemoryNetwork::new();
    let receiver_context = context_with(&network, "receiver", config.clone());
    let sender_context = context_with(&network, "sender", config);
    let mut capabilities = vec![caps::CONNECTION_ONE_TO_ONE];
    capabilities.extend_from_slice(extra);
    let port_type = port_type(&capabilities);
    let receive = receiver_context
        .receive_port(port_type.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    receive.enable_connections();
    let send = sender_context
        .send_port(port_type)
        .name("outbox")
        .build()
        .expect("创建发送端口失败");
    send.connect_timeout(receive.identifier(), PATIENCE)
        .expect("连接失败");
    Pair {
        _receiver_context: receiver_context,
        _sender_context: sender_context,
        receive,
        send,
    }
}

#[test]
fn typed_values_arrive_in_program_order() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);

    let mut message = pair.send.new_message().expect("创建消息失败");
    message.write_int(42).expect("写入失败");
    message.write_array(&[1u8, 2, 3]).expect("写入失败");
    message.write_string("端口").expect("写入失败");
    message.write_double(1.5).expect("写入失败");
    message.write_bool(true).expect("写入失败");
    message.finish().expect("结束消息失败");

    let mut inbound = pair.receive.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(inbound.read_int().expect("读取失败"), 42);
    let mut bytes = [0u8; 3];
    inbound.read_array(&mut bytes).expect("读取失败");
    assert_eq!(bytes, [1, 2, 3]);
    assert_eq!(inbound.read_string().expect("读取失败"), "端口");
    assert_eq!(inbound.read_double().expect("读取失败"), 1.5);
    assert!(inbound.read_bool().expect("读取失败"));
    assert_eq!(inbound.origin(), pair.send.identifier());
    assert_eq!(inbound.sequence_number(), None);
    inbound.finish().expect("结束消息失败");
    assert!(inbound.finish().is_err(), "重复结束应当报错");

    assert_eq!(pair.receive.management_property(stats::MESSAGES), Some(1));
    assert_eq!(pair.send.management_property(stats::MESSAGES), Some(1));
    assert_eq!(pair.receive.connected_to(), vec![pair.send.identifier().clone()]);

    pair.send.close().expect("关闭发送端口失败");
    pair.receive.close();
}

#[test]
fn arrays_larger_than_a_segment_span_frames() {
    init_tracing();
    let mut config = TransportConfig::default();
    config.buffer.segment_capacity = 64;
    let pair = connected_pair(config, &[]);

    let values: Vec<i32> = (0..1000).collect();
    let mut message = pair.send.new_message().expect("创建消息失败");
    message.write_array(&values).expect("写入失败");
    message.write_long(-7).expect("写入失败");
    let written = message.finish().expect("结束消息失败");
    assert_eq!(written, 1000 * 4 + 8);

    let mut inbound = pair.receive.receive_timeout(PATIENCE).expect("接收失败");
    let mut received = vec![0i32; values.len()];
    inbound.read_array(&mut received).expect("读取失败");
    assert_eq!(received, values);
    assert_eq!(inbound.read_long().expect("读取失败"), -7);
    assert_eq!(inbound.finish().expect("结束消息失败"), written);
    assert!(
        pair.send.management_property(stats::BYTES).expect("计数器缺失") > written,
        "线上字节应包含帧头与填充"
    );
}

#[test]
fn receive_timeout_keeps_late_messages() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);

    let err = pair
        .receive
        .receive_timeout(Duration::ZERO)
        .expect_err("没有消息时应当超时");
    assert!(err.is_timeout());
    assert!(matches!(err, PortError::ReceiveTimedOut));
    assert!(pair.receive.poll().expect("轮询失败").is_none());

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            let mut message = pair.send.new_message().expect("创建消息失败");
            message.write_short(7).expect("写入失败");
            message.finish().expect("结束消息失败");
        });
        let early = pair.receive.receive_timeout(Duration::from_millis(1));
        if let Ok(mut message) = early {
            assert_eq!(message.read_short().expect("读取失败"), 7);
            return;
        }
        let mut late = pair.receive.receive_timeout(PATIENCE).expect("超时之后到达的消息应当仍可接收");
        assert_eq!(late.read_short().expect("读取失败"), 7);
    });
}

#[test]
fn poll_returns_complete_messages_only() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);

    let mut message = pair.send.new_message().expect("创建消息失败");
    message.write_float(0.25).expect("写入失败");
    message.finish().expect("结束消息失败");

    let polled = common::eventually(|| match pair.receive.poll().expect("轮询失败") {
        Some(mut inbound) => {
            assert_eq!(inbound.read_float().expect("读取失败"), 0.25);
            true
        }
        None => false,
    });
    assert!(polled, "消息应当最终可以轮询到");
}

#[test]
fn concurrent_receivers_split_messages_without_overlap() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);
    const TOTAL: usize = 40;

    for value in 0..TOTAL as i32 {
        let mut message = pair.send.new_message().expect("创建消息失败");
        message.write_int(value).expect("写入失败");
        message.finish().expect("结束消息失败");
    }

    let delivered = AtomicUsize::new(0);
    let seen = Mutex::new(Vec::with_capacity(TOTAL));
    let deadline = Instant::now() + PATIENCE;
    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                while delivered.load(Ordering::SeqCst) < TOTAL && Instant::now() < deadline {
                    match pair.receive.receive_timeout(Duration::from_millis(50)) {
                        Ok(mut inbound) => {
                            let value = inbound.read_int().expect("读取失败");
                            inbound.finish().expect("结束消息失败");
                            seen.lock().expect("锁中毒").push(value);
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(PortError::ReceiveTimedOut) => {}
                        Err(other) => panic!("接收失败：{other}"),
                    }
                }
            });
        }
    });

    let mut seen = seen.into_inner().expect("锁中毒");
    seen.sort_unstable();
    assert_eq!(seen, (0..TOTAL as i32).collect::<Vec<_>>(), "每条消息恰好交付一次");
}

#[test]
fn numbered_ports_count_per_sender_name() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[caps::COMMUNICATION_NUMBERED]);

    for value in 0..3 {
        let mut message = pair.send.new_message().expect("创建消息失败");
        message.write_int(value).expect("写入失败");
        message.finish().expect("结束消息失败");
    }
    for expected in 0..3i64 {
        let mut inbound = pair.receive.receive_timeout(PATIENCE).expect("接收失败");
        assert_eq!(inbound.sequence_number(), Some(expected));
        assert_eq!(inbound.read_int().expect("读取失败"), expected as i32);
    }
}

#[test]
fn unfinished_read_message_blocks_next_delivery() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);

    for value in [1i64, 2] {
        let mut message = pair.send.new_message().expect("创建消息失败");
        message.write_long(value).expect("写入失败");
        message.write_long(value * 10).expect("写入失败");
        message.finish().expect("结束消息失败");
    }

    let mut first = pair.receive.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(first.read_long().expect("读取失败"), 1);
    let blocked = pair.receive.receive_timeout(Duration::from_millis(100));
    assert!(matches!(blocked, Err(PortError::ReceiveTimedOut)));
    // 未读完的部分随结束丢弃，下一条消息从头开始。
    first.finish().expect("结束消息失败");

    let mut second = pair.receive.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(second.read_long().expect("读取失败"), 2);
    assert_eq!(second.read_long().expect("读取失败"), 20);
}

#[test]
fn byte_only_ports_reject_typed_writes() {
    init_tracing();
    let network = MemoryNetwork::new();
    let context = context(&network, "bytes");
    let port_type = spark_port::PortType::new([
        caps::SERIALIZATION_BYTE,
        caps::CONNECTION_ONE_TO_ONE,
        caps::RECEIVE_EXPLICIT,
    ]);
    let send = context.send_port(port_type).build().expect("创建发送端口失败");
    let mut message = send.new_message().expect("没有连接时也可以创建消息");
    assert!(matches!(
        message.write_int(1),
        Err(PortError::Configuration(_))
    ));
    message.write_byte(1).expect("字节写入应当允许");
    message.finish().expect("没有连接时结束消息不应报错");
}

#[test]
fn management_counters_can_be_reset() {
    init_tracing();
    let pair = connected_pair(TransportConfig::default(), &[]);
    let mut message = pair.send.new_message().expect("创建消息失败");
    message.write_int(1).expect("写入失败");
    message.finish().expect("结束消息失败");

    let properties = pair.send.management_properties();
    assert_eq!(properties.get(stats::MESSAGES), Some(&1));
    assert_eq!(properties.get(stats::CONNECTIONS), Some(&1));
    pair.send
        .reset_management_property(stats::MESSAGES)
        .expect("重置失败");
    assert_eq!(pair.send.management_property(stats::MESSAGES), Some(0));
    assert!(pair.send.reset_management_property("Nope").is_err());
}
