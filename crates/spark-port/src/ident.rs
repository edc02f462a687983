//! 端点与端口标识。
//!
//! 标识在本层只有两个用途：作为可比较、可哈希的键，以及携带建连所需的引导地址。
//! 编码沿用 [`crate::wire`] 的长度前缀格式，握手与 `CLOSE_ONE_CONNECTION` 都直接使用它。

use core::fmt;

use bytes::{Bytes, BytesMut};
use spark_transport::TransportAddress;

use crate::wire::{DecodeError, Reader, put_bytes, put_str};

/// 端点标识：池名、端点名与引导地址。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pool: String,
    name: String,
    address: TransportAddress,
}

impl EndpointId {
    /// 构造端点标识。
    pub fn new(pool: impl Into<String>, name: impl Into<String>, address: TransportAddress) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            address,
        }
    }

    /// 所属池名。
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// 端点名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 建连用的引导地址。
    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
        put_str(dst, &self.pool);
        put_str(dst, &self.name);
        put_bytes(dst, self.address.as_bytes());
    }

    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let pool = reader.str()?.to_owned();
        let name = reader.str()?.to_owned();
        let address = TransportAddress::new(Bytes::copy_from_slice(reader.bytes()?));
        Ok(Self {
            pool,
            name,
            address,
        })
    }

    /// 规范编码。
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// 从规范编码还原。
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let id = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(id)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.name)
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointId")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

macro_rules! port_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            endpoint: EndpointId,
            name: String,
        }

        impl $name {
            /// 由所属端点与端口名构造。
            pub fn new(endpoint: EndpointId, name: impl Into<String>) -> Self {
                Self {
                    endpoint,
                    name: name.into(),
                }
            }

            /// 所属端点。
            pub fn endpoint(&self) -> &EndpointId {
                &self.endpoint
            }

            /// 端口名。
            pub fn name(&self) -> &str {
                &self.name
            }

            pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
                self.endpoint.encode_into(dst);
                put_str(dst, &self.name);
            }

            pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
                let endpoint = EndpointId::decode_from(reader)?;
                let name = reader.str()?.to_owned();
                Ok(Self { endpoint, name })
            }

            /// 规范编码。
            pub fn to_bytes(&self) -> Bytes {
                let mut buf = BytesMut::new();
                self.encode_into(&mut buf);
                buf.freeze()
            }

            /// 从规范编码还原。
            pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
                let mut reader = Reader::new(bytes);
                let id = Self::decode_from(&mut reader)?;
                reader.finish()?;
                Ok(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}@{}", self.name, self.endpoint)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("name", &self.name)
                    .field("endpoint", &self.endpoint)
                    .finish()
            }
        }
    };
}

port_id! {
    /// 发送端口标识。
    SendPortId
}

port_id! {
    /// 接收端口标识；同时是建连目标。
    ReceivePortId
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointId {
        EndpointId::new("pool", "node-1", TransportAddress::from_text("mem:1"))
    }

    #[test]
    fn receive_port_id_survives_encoding() {
        let id = ReceivePortId::new(endpoint(), "inbox");
        let decoded = ReceivePortId::decode(&id.to_bytes()).expect("解码失败");
        assert_eq!(decoded, id);
        assert_eq!(decoded.to_string(), "inbox@pool/node-1");
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = SendPortId::new(endpoint(), "out").to_bytes().to_vec();
        raw.push(0);
        assert_eq!(
            SendPortId::decode(&raw),
            Err(DecodeError::TrailingBytes(1))
        );
    }
}
