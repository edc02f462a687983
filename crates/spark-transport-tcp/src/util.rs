use std::{io, net::SocketAddr};

use spark_transport::{TransportAddress, TransportError};

/// 把引导地址解析为套接字地址。
pub(crate) fn to_socket_addr(address: &TransportAddress) -> Result<SocketAddr, TransportError> {
    address
        .as_text()
        .and_then(|text| text.parse::<SocketAddr>().ok())
        .ok_or_else(|| TransportError::InvalidAddress {
            address: address.clone(),
        })
}

/// 建连失败时区分“拒绝”与其它 IO 错误，供上层给出可操作的错误类别。
pub(crate) fn map_connect_error(address: &TransportAddress, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        TransportError::Refused {
            address: address.clone(),
        }
    } else {
        TransportError::io(spark_transport::error::CONNECT, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_textual_socket_address() {
        let addr = to_socket_addr(&TransportAddress::from_text("127.0.0.1:4000"))
            .expect("解析地址失败");
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn rejects_memory_addresses() {
        let err = to_socket_addr(&TransportAddress::from_text("mem:3")).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }
}
