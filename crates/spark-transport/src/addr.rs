use core::fmt;

use bytes::Bytes;

/// 建立连接所需的引导地址。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端点标识在本层只承担“足以打开通道”的职责，具体格式由传输绑定决定：
///   TCP 绑定存放 `ip:port` 文本，进程内网络存放 `mem:<n>`；
/// - 对上层而言它是可比较、可哈希的不透明字节串，可以原样编码进端口标识。
///
/// ## 契约（What）
/// - 内部使用 [`Bytes`]，克隆为引用计数复制；
/// - [`Display`](fmt::Display) 以有损 UTF-8 形式输出，仅用于日志。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddress(Bytes);

impl TransportAddress {
    /// 以任意字节构造地址。
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// 以文本构造地址。
    pub fn from_text(text: &str) -> Self {
        Self(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// 返回原始字节。
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 尝试按 UTF-8 解释地址。
    pub fn as_text(&self) -> Option<&str> {
        core::str::from_utf8(&self.0).ok()
    }

    /// 取出内部字节。
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportAddress")
            .field(&String::from_utf8_lossy(&self.0))
            .finish()
    }
}

impl From<std::net::SocketAddr> for TransportAddress {
    fn from(value: std::net::SocketAddr) -> Self {
        Self::from_text(&value.to_string())
    }
}
