//! 连接上的控制协议。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 一条连接的字节流由两部分组成：建连时的一次握手，以及之后交替出现的控制字节与数据帧；
//! - 控制字节必须先于帧被消费，接收方才能区分“新消息”“新接收者加入”“关闭”。
//!
//! ## 线格式（What）
//! - 握手请求：`NEW_CONNECTION`、4 字节大端长度、请求体（发送端口标识、目标端口名、端口类型编码）；
//! - 握手应答：一个应答码字节，取值见 [`ConnectReply`]；
//! - `CLOSE_ONE_CONNECTION` 之后跟随一个 BYTES 段中的 4 字节大端长度与接收端口标识编码，
//!   以普通帧的形式发送。

use std::io;

use bytes::{Bytes, BytesMut};
use spark_transport::{Channel, read_exact};

use crate::{
    CapabilitySet, PortError, PortType, ReceivePortId, RefusalReason, SendPortId,
    wire::{MAX_FIELD_LEN, Reader, put_bytes, put_str},
};

/// 新接收者加入，之后的内容仍属同一个流。
pub const NEW_RECEIVER: u8 = 1;
/// 新消息开始。
pub const NEW_MESSAGE: u8 = 2;
/// 发送端口关闭，所有连接结束。
pub const CLOSE_ALL_CONNECTIONS: u8 = 3;
/// 关闭指定接收端口的连接，后跟一帧携带目标标识。
pub const CLOSE_ONE_CONNECTION: u8 = 4;
/// 建连握手请求。
pub const NEW_CONNECTION: u8 = 5;

/// 握手应答码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReply {
    Accepted = 0,
    Denied = 1,
    Disabled = 2,
    AlreadyConnected = 3,
    TypeMismatch = 4,
    NotPresent = 5,
    NoManyToX = 6,
}

impl ConnectReply {
    /// 非接受应答对应的错误。
    pub(crate) fn into_result(self, target: &ReceivePortId) -> Result<(), PortError> {
        let reason = match self {
            Self::Accepted => return Ok(()),
            Self::AlreadyConnected => {
                return Err(PortError::AlreadyConnected {
                    target: target.clone(),
                });
            }
            Self::Denied => RefusalReason::Denied,
            Self::Disabled => RefusalReason::Disabled,
            Self::TypeMismatch => RefusalReason::TypeMismatch,
            Self::NotPresent => RefusalReason::NotPresent,
            Self::NoManyToX => RefusalReason::NoManyToX,
        };
        Err(PortError::ConnectionRefused {
            target: target.clone(),
            reason,
        })
    }
}

impl TryFrom<u8> for ConnectReply {
    type Error = PortError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Accepted,
            1 => Self::Denied,
            2 => Self::Disabled,
            3 => Self::AlreadyConnected,
            4 => Self::TypeMismatch,
            5 => Self::NotPresent,
            6 => Self::NoManyToX,
            other => {
                return Err(PortError::protocol(format!(
                    "unknown connect reply code {other}"
                )));
            }
        })
    }
}

/// 握手请求体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HandshakeRequest {
    pub(crate) origin: SendPortId,
    pub(crate) port_name: String,
    pub(crate) port_type: PortType,
}

impl HandshakeRequest {
    fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.origin.encode_into(&mut body);
        put_str(&mut body, &self.port_name);
        put_bytes(&mut body, &self.port_type.capabilities().to_bytes());

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.extend_from_slice(&[NEW_CONNECTION]);
        put_bytes(&mut frame, &body);
        frame.freeze()
    }

    fn decode(body: &[u8]) -> Result<Self, PortError> {
        let mut reader = Reader::new(body);
        let origin = SendPortId::decode_from(&mut reader)?;
        let port_name = reader.str()?.to_owned();
        let capabilities = CapabilitySet::decode(reader.bytes()?)?;
        reader.finish()?;
        Ok(Self {
            origin,
            port_name,
            port_type: PortType::from_capabilities(capabilities),
        })
    }
}

pub(crate) async fn write_request(
    channel: &dyn Channel,
    request: &HandshakeRequest,
) -> io::Result<()> {
    channel.write_all(&request.encode()).await?;
    channel.flush().await
}

pub(crate) async fn read_request(channel: &dyn Channel) -> Result<HandshakeRequest, PortError> {
    let mut opcode = [0u8; 1];
    read_exact(channel, &mut opcode)
        .await
        .map_err(|err| PortError::io("read handshake", err))?;
    if opcode[0] != NEW_CONNECTION {
        return Err(PortError::protocol(format!(
            "expected handshake opcode, got {}",
            opcode[0]
        )));
    }
    let mut len = [0u8; 4];
    read_exact(channel, &mut len)
        .await
        .map_err(|err| PortError::io("read handshake", err))?;
    let len = u32::from_be_bytes(len) as usize;
    // 请求体含三个变长字段，上限按字段上限的倍数放宽。
    if len > 4 * MAX_FIELD_LEN {
        return Err(PortError::protocol(format!(
            "handshake body of {len} bytes exceeds the limit"
        )));
    }
    let mut body = vec![0u8; len];
    read_exact(channel, &mut body)
        .await
        .map_err(|err| PortError::io("read handshake", err))?;
    HandshakeRequest::decode(&body)
}

pub(crate) async fn write_reply(channel: &dyn Channel, reply: ConnectReply) -> io::Result<()> {
    channel.write_all(&[reply as u8]).await?;
    channel.flush().await
}

pub(crate) async fn read_reply(channel: &dyn Channel) -> Result<ConnectReply, PortError> {
    let mut code = [0u8; 1];
    read_exact(channel, &mut code)
        .await
        .map_err(|err| PortError::io("read connect reply", err))?;
    ConnectReply::try_from(code[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndpointId, caps};
    use spark_transport::{ChannelFactory, MemoryNetwork, TransportAddress};

    fn request() -> HandshakeRequest {
        HandshakeRequest {
            origin: SendPortId::new(
                EndpointId::new("pool", "a", TransportAddress::from_text("mem:1")),
                "out",
            ),
            port_name: "inbox".into(),
            port_type: PortType::new([caps::SERIALIZATION_DATA, caps::RECEIVE_EXPLICIT]),
        }
    }

    #[tokio::test]
    async fn handshake_crosses_a_channel() {
        let network = MemoryNetwork::new();
        let server = network.bind();
        let client = network.bind();
        let outbound = client
            .connect(&server.local_address())
            .await
            .expect("建连失败");
        let inbound = server.accept().await.expect("接受失败");

        write_request(outbound.as_ref(), &request())
            .await
            .expect("写请求失败");
        let received = read_request(inbound.as_ref()).await.expect("读请求失败");
        assert_eq!(received, request());

        write_reply(inbound.as_ref(), ConnectReply::NoManyToX)
            .await
            .expect("写应答失败");
        let reply = read_reply(outbound.as_ref()).await.expect("读应答失败");
        assert_eq!(reply, ConnectReply::NoManyToX);
    }

    #[test]
    fn reply_codes_map_to_errors() {
        let target = request().origin;
        let target = ReceivePortId::new(target.endpoint().clone(), "inbox");
        assert!(ConnectReply::Accepted.into_result(&target).is_ok());
        assert!(matches!(
            ConnectReply::AlreadyConnected.into_result(&target),
            Err(PortError::AlreadyConnected { .. })
        ));
        assert!(matches!(
            ConnectReply::try_from(7),
            Err(PortError::Protocol(_))
        ));
    }
}
