//! `tcp_smoke` 集成测试：在本机回环 TCP 上完成一次完整的收发与关闭。

mod common;

use common::{PATIENCE, init_tracing, port_type};
use spark_port::{TransportContext, caps};

#[test]
fn loopback_exchange() {
    init_tracing();
    let address = "127.0.0.1:0".parse().expect("地址解析失败");
    let receiver = TransportContext::builder()
        .pool("tcp")
        .name("receiver")
        .tcp(address)
        .expect("绑定接收端失败");
    let sender = TransportContext::builder()
        .pool("tcp")
        .name("sender")
        .tcp(address)
        .expect("绑定发送端失败");
    let port_type = port_type(&[caps::CONNECTION_ONE_TO_ONE]);

    let inbox = receiver
        .receive_port(port_type.clone(), "inbox")
        .build()
        .expect("创建接收端口失败");
    inbox.enable_connections();
    let send = sender.send_port(port_type).build().expect("创建发送端口失败");
    send.connect_timeout(inbox.identifier(), PATIENCE).expect("连接失败");

    let mut message = send.new_message().expect("创建消息失败");
    message.write_long(i64::MIN).expect("写入失败");
    message.write_string("over tcp").expect("写入失败");
    message.finish().expect("结束消息失败");

    let mut inbound = inbox.receive_timeout(PATIENCE).expect("接收失败");
    assert_eq!(inbound.read_long().expect("读取失败"), i64::MIN);
    assert_eq!(inbound.read_string().expect("读取失败"), "over tcp");
    inbound.finish().expect("结束消息失败");

    send.close().expect("关闭发送端口失败");
    inbox.close();
    sender.end();
    receiver.end();
}
