//! `connection_lifecycle` 集成测试：建连、拒绝、扇出隔离与关闭。
//!
//! # 测试目标（Why）
//! - 建连失败的每一种原因都可区分，超时与拒绝不混淆；
//! - 扇出时单条连接失败不影响其余连接；
//! - 发送端口关闭会通知每个接收方，接收侧以“无原因”的丢失事件收尾。

mod common;

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use common::{PATIENCE, context, eventually, init_tracing, port_type};
use spark_port::{
    ConnectOptions, EndpointId, MemoryNetwork, PortError, ReceivePortConnectUpcall, ReceivePortId,
    RefusalReason, SendPortId, TransportAddress, caps, stats,
};
use spark_transport::ChannelFactory;

#[derive(Default)]
struct Recorder {
    admit: bool,
    gained: Mutex<Vec<SendPortId>>,
    lost: Mutex<Vec<(SendPortId, bool)>>,
}

impl Recorder {
    fn admitting() -> Arc<Self> {
        Arc::new(Self {
            admit: true,
            ..Self::default()
        })
    }

    fn lost(&self) -> Vec<(SendPortId, bool)> {
        self.lost.lock().expect("锁中毒").clone()
    }
}

impl ReceivePortConnectUpcall for Recorder {
    fn got_connection(&self, _port: &ReceivePortId, origin: &SendPortId) -> bool {
        self.gained.lock().expect("锁中毒").push(origin.clone());
        self.admit
    }

    fn lost_connection(&self, _port: &ReceivePortId, origin: &SendPortId, cause: Option<&PortError>) {
        self.lost
            .lock()
            .expect("锁中毒")
            .push((origin.clone(), cause.is_none()));
    }
}

fn refusal(err: PortError) -> RefusalReason {
    match err {
        PortError::ConnectionRefused { reason, .. } => reason,
        other => panic!("期望拒绝错误，实际为 {other:?}"),
    }
}

/// 断言在期限到达之后、且没有拖到很久才报告建连超时。
#[track_caller]
fn assert_timed_out_at_deadline(result: Result<(), PortError>, started: Instant, timeout: Duration) {
    let elapsed = started.elapsed();
    let err = result.expect_err("期限内无法建连应当超时");
    assert!(matches!(err, PortError::ConnectionTimedOut { .. }), "{err:?}");
    assert!(err.is_timeout());
    assert!(elapsed >= timeout, "不应早于期限返回：{elapsed:?}");
    assert!(elapsed < PATIENCE, "不应拖过期限太久：{elapsed:?}");
}

const SHORT: Duration = Duration::from_millis(200);

#[test]
fn silent_endpoint_times_out() {
    init_tracing();
    let network = MemoryNetwork::new();
    let silent = network.bind();
    let sender = context(&network, "sender");
    let target = ReceivePortId::new(
        EndpointId::new("test", "silent", silent.local_address()),
        "nobody",
    );
    let send = sender
        .send_port(port_type(&[caps::CONNECTION_ONE_TO_ONE]))
        .build()
        .expect("创建发送端口失败");

    let started = Instant::now();
    assert_timed_out_at_deadline(send.connect_timeout(&target, SHORT), started, SHORT);
    assert!(send.connected_to().is_empty());
}

#[test]
fn unbound_address_times_out_at_the_deadline() {
    init_tracing();
    let network = MemoryNetwork::new();
    let sender = context(&network, "sender");
    let target = ReceivePortId::new(
        EndpointId::new("test", "gone", TransportAddress::from_text("mem:unbound")),
        "inbox",
    );
    let send = sender
        .send_port(port_type(&[caps::CONNECTION_ONE_TO_ONE]))
        .build()
        .expect("创建发送端口失败");

    let started = Instant::now();
    assert_timed_out_at_deadline(send.connect_timeout(&target, SHORT), started, SHORT);
    assert!(send.connected_to().is_empty());
}

#[test]
fn zero_timeout_means_no_deadline() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_ONE]);
    let inbox = receiver
        .receive_port(port_type.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");

    thread::scope(|scope| {
        let connecting = scope.spawn(|| {
            // 普通线程上没有 Tokio 运行时，建连必须自行进入上下文的运行时。
            assert!(tokio::runtime::Handle::try_current().is_err());
            send.connect_timeout(inbox.identifier(), Duration::ZERO)
        });
        thread::sleep(SHORT);
        inbox.enable_connections();
        connecting
            .join()
            .expect("建连线程崩溃")
            .expect("零期限不应立即超时");
    });
    assert_eq!(send.connected_to(), vec![inbox.identifier().clone()]);
}

#[test]
fn refusals_carry_their_reason() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let one_to_one = port_type(&[caps::CONNECTION_ONE_TO_ONE]);

    // 端口不存在或尚未启用连接都是“未就绪”，重试到期限用完后报告超时。
    let missing = receiver.receive_port_id("missing");
    let send = sender.send_port(one_to_one.clone()).build().expect("创建发送端口失败");
    let started = Instant::now();
    assert_timed_out_at_deadline(send.connect_timeout(&missing, SHORT), started, SHORT);

    let inbox = receiver
        .receive_port(one_to_one.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    let started = Instant::now();
    assert_timed_out_at_deadline(send.connect_timeout(inbox.identifier(), SHORT), started, SHORT);

    inbox.enable_connections();
    let other_type = sender
        .send_port(port_type(&[caps::CONNECTION_MANY_TO_ONE]))
        .build()
        .expect("创建发送端口失败");
    let err = other_type
        .connect_timeout(inbox.identifier(), PATIENCE)
        .expect_err("端口类型不同");
    assert_eq!(refusal(err), RefusalReason::TypeMismatch);

    send.connect_timeout(inbox.identifier(), PATIENCE).expect("连接失败");
    let err = send
        .connect_timeout(inbox.identifier(), PATIENCE)
        .expect_err("重复连接");
    assert!(matches!(err, PortError::AlreadyConnected { .. }));

    let second = sender.send_port(one_to_one).build().expect("创建发送端口失败");
    let err = second
        .connect_timeout(inbox.identifier(), PATIENCE)
        .expect_err("一对一端口不接受第二个发送方");
    assert_eq!(refusal(err), RefusalReason::NoManyToX);
}

#[test]
fn same_named_sender_is_already_connected() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let many_to_one = port_type(&[caps::CONNECTION_MANY_TO_ONE]);
    let inbox = receiver
        .receive_port(many_to_one.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    inbox.enable_connections();

    let first = sender.send_port(many_to_one.clone()).name("dup").build().expect("创建发送端口失败");
    let twin = sender.send_port(many_to_one).name("dup").build().expect("创建发送端口失败");
    first.connect_timeout(inbox.identifier(), PATIENCE).expect("连接失败");
    let err = twin
        .connect_timeout(inbox.identifier(), PATIENCE)
        .expect_err("同名发送端口视为同一发送方");
    assert!(matches!(err, PortError::AlreadyConnected { .. }));
}

#[test]
fn denied_by_connect_upcall() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_ONE, caps::CONNECTION_UPCALLS]);
    let recorder = Arc::new(Recorder::default());
    let inbox = receiver
        .receive_port(port_type.clone(), "inbox")
        .connect_upcall(recorder.clone())
        .build()
        .expect("创建接收端口失败");
    inbox.enable_connections();
    let send = sender.send_port(port_type).name("rejected").build().expect("创建发送端口失败");

    let err = send.connect_timeout(inbox.identifier(), PATIENCE).expect_err("应当被拒绝");
    assert_eq!(refusal(err), RefusalReason::Denied);
    assert_eq!(recorder.gained.lock().expect("锁中毒").len(), 1);
    assert!(inbox.connected_to().is_empty());
}

#[test]
fn connect_waits_for_enable_within_deadline() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_ONE]);
    let inbox = receiver
        .receive_port(port_type.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            inbox.enable_connections();
        });
        send.connect_timeout(inbox.identifier(), PATIENCE)
            .expect("启用后重试应当成功");
    });
    assert_eq!(send.connected_to(), vec![inbox.identifier().clone()]);
}

#[test]
fn connect_many_reports_partial_success() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_MANY]);
    let present = receiver
        .receive_port(port_type.clone(), "present")
        .build()
        .expect("创建接收端口失败");
    present.enable_connections();
    let absent = receiver.receive_port_id("absent");
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");

    let err = send
        .connect_many(
            &[present.identifier().clone(), absent.clone()],
            ConnectOptions::with_timeout(Duration::from_millis(400)),
        )
        .expect_err("部分目标不存在");
    let PortError::ConnectionsFailed(report) = err else {
        panic!("期望聚合错误");
    };
    assert_eq!(report.obtained, vec![present.identifier().clone()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, absent);
    assert!(report.failures[0].1.is_timeout(), "{:?}", report.failures[0].1);
    assert_eq!(send.connected_to(), vec![present.identifier().clone()]);
}

#[test]
fn connect_many_with_fill_timeout_retries_late_targets() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_MANY]);
    let early = receiver
        .receive_port(port_type.clone(), "early")
        .build()
        .expect("创建接收端口失败");
    early.enable_connections();
    let late = receiver
        .receive_port(port_type.clone(), "late")
        .build()
        .expect("创建接收端口失败");
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(SHORT);
            late.enable_connections();
        });
        send.connect_many(
            &[late.identifier().clone(), early.identifier().clone()],
            ConnectOptions::retrying(PATIENCE),
        )
        .expect("期限内所有目标都应连上");
    });
    let mut expected = vec![early.identifier().clone(), late.identifier().clone()];
    expected.sort();
    let mut connected = send.connected_to();
    connected.sort();
    assert_eq!(connected, expected);
}

#[test]
fn concurrent_connects_respect_single_target_ports() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_ONE]);
    let inboxes: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let port = receiver
                .receive_port(port_type.clone(), name)
                .build()
                .expect("创建接收端口失败");
            port.enable_connections();
            port
        })
        .collect();
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");

    let results: Vec<Result<(), PortError>> = thread::scope(|scope| {
        let handles: Vec<_> = inboxes
            .iter()
            .map(|inbox| scope.spawn(|| send.connect_timeout(inbox.identifier(), PATIENCE)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("建连线程崩溃"))
            .collect()
    });
    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(succeeded, 1, "一对一发送端口只能连上一个接收端口：{results:?}");
    assert!(
        results
            .iter()
            .any(|result| matches!(result, Err(PortError::Configuration(_)))),
        "{results:?}"
    );
    assert_eq!(send.connected_to().len(), 1);
}

#[test]
fn late_receiver_joins_a_started_stream() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_MANY]);
    let first = receiver.receive_port(port_type.clone(), "first").build().expect("创建接收端口失败");
    let second = receiver.receive_port(port_type.clone(), "second").build().expect("创建接收端口失败");
    first.enable_connections();
    second.enable_connections();
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");
    send.connect_timeout(first.identifier(), PATIENCE).expect("连接失败");

    let mut message = send.new_message().expect("创建消息失败");
    message.write_int(1).expect("写入失败");
    message.finish().expect("结束消息失败");
    send.connect_timeout(second.identifier(), PATIENCE).expect("连接失败");
    let mut message = send.new_message().expect("创建消息失败");
    message.write_int(2).expect("写入失败");
    message.finish().expect("结束消息失败");

    for expected in [1, 2] {
        let mut inbound = first.receive_timeout(PATIENCE).expect("接收失败");
        assert_eq!(inbound.read_int().expect("读取失败"), expected);
    }
    let mut inbound = second.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(inbound.read_int().expect("读取失败"), 2);
    assert_eq!(first.connected_to().len(), 1);
}

#[test]
fn fan_out_survives_one_lost_receiver() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_MANY, caps::CONNECTION_DOWNCALLS]);
    let inboxes: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let port = receiver
                .receive_port(port_type.clone(), name)
                .build()
                .expect("创建接收端口失败");
            port.enable_connections();
            port
        })
        .collect();
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");
    for inbox in &inboxes {
        send.connect_timeout(inbox.identifier(), PATIENCE).expect("连接失败");
    }

    let lost_target = inboxes[1].identifier().clone();
    inboxes[1].close_timeout(Duration::ZERO);

    let mut value = 0;
    let lost = eventually(|| {
        value += 1;
        let mut message = send.new_message().expect("创建消息失败");
        message.write_int(value).expect("其余连接仍然可写");
        message.finish().expect("其余连接仍然可写");
        for inbox in [&inboxes[0], &inboxes[2]] {
            let mut inbound = inbox.receive_timeout(PATIENCE).expect("存活的接收方应当收到消息");
            assert_eq!(inbound.read_int().expect("读取失败"), value);
        }
        send.connected_to().len() == 2
    });
    assert!(lost, "失效的连接应当被摘除");
    assert_eq!(send.lost_connections().expect("需要下行调用能力"), vec![lost_target]);
    assert_eq!(send.management_property(stats::LOST_CONNECTIONS), Some(1));
}

#[test]
fn close_notifies_every_receiver() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[
        caps::CONNECTION_ONE_TO_MANY,
        caps::CONNECTION_UPCALLS,
        caps::CONNECTION_DOWNCALLS,
    ]);
    let recorder = Recorder::admitting();
    let inboxes: Vec<_> = (0..3)
        .map(|index| {
            let port = receiver
                .receive_port(port_type.clone(), format!("inbox-{index}"))
                .connect_upcall(recorder.clone())
                .build()
                .expect("创建接收端口失败");
            port.enable_connections();
            port
        })
        .collect();
    let send = sender.send_port(port_type).name("closer").build().expect("创建发送端口失败");
    for inbox in &inboxes {
        send.connect_timeout(inbox.identifier(), PATIENCE).expect("连接失败");
    }
    send.close().expect("每个接收方都应确认关闭");
    assert!(send.new_message().is_err(), "关闭后不能再创建消息");

    assert!(eventually(|| recorder.lost().len() == 3), "每个接收方都应记录一次丢失");
    for (origin, clean) in recorder.lost() {
        assert_eq!(&origin, send.identifier());
        assert!(clean, "正常关闭不应携带原因");
    }
    for inbox in &inboxes {
        assert_eq!(inbox.new_connections().expect("需要下行调用能力").len(), 1);
        assert_eq!(inbox.lost_connections().expect("需要下行调用能力").len(), 1);
        assert!(inbox.lost_connections().expect("需要下行调用能力").is_empty());
        assert_eq!(inbox.management_property(stats::CLOSED_CONNECTIONS), Some(1));
        inbox.close();
    }
}

#[test]
fn disconnect_targets_a_single_receiver() {
    init_tracing();
    let network = MemoryNetwork::new();
    let receiver = context(&network, "receiver");
    let sender = context(&network, "sender");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_MANY]);
    let first = receiver.receive_port(port_type.clone(), "first").build().expect("创建接收端口失败");
    let second = receiver.receive_port(port_type.clone(), "second").build().expect("创建接收端口失败");
    first.enable_connections();
    second.enable_connections();
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");
    send.connect_timeout(first.identifier(), PATIENCE).expect("连接失败");
    send.connect_timeout(second.identifier(), PATIENCE).expect("连接失败");

    send.disconnect(first.identifier()).expect("断开失败");
    assert_eq!(send.connected_to(), vec![second.identifier().clone()]);
    assert!(eventually(|| first.connected_to().is_empty()));

    let mut message = send.new_message().expect("创建消息失败");
    message.write_char(0x41).expect("写入失败");
    message.finish().expect("结束消息失败");
    let mut inbound = second.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(inbound.read_char().expect("读取失败"), 0x41);
    assert_eq!(second.connected_to().len(), 1);
}

#[test]
fn configuration_errors_are_reported() {
    init_tracing();
    let network = MemoryNetwork::new();
    let context = context(&network, "config");
    let plain = port_type(&[caps::CONNECTION_ONE_TO_ONE]);

    let inbox = context.receive_port(plain.clone(), "inbox").build().expect("创建接收端口失败");
    assert!(matches!(inbox.new_connections(), Err(PortError::Configuration(_))));
    assert!(matches!(
        context.receive_port(plain.clone(), "inbox").build(),
        Err(PortError::Configuration(_))
    ));

    let upcall_type = port_type(&[caps::CONNECTION_ONE_TO_ONE, caps::RECEIVE_AUTO_UPCALLS]);
    let upcall_port = context
        .receive_port(upcall_type, "upcalls")
        .message_upcall(Arc::new(
            |_: &mut spark_port::ReadMessage| -> Result<(), PortError> { Ok(()) },
        ))
        .build()
        .expect("创建接收端口失败");
    assert!(matches!(upcall_port.receive(), Err(PortError::Configuration(_))));

    let strange = spark_port::PortType::new(["connection.telepathy"]);
    assert!(matches!(
        context.send_port(strange).build(),
        Err(PortError::CapabilityMismatch { .. })
    ));
}
