use core::fmt;

use crate::{CapabilitySet, IoStrategy};

/// 端口类型识别的能力标签。
pub mod caps {
    /// 只传输基本类型数据。
    pub const SERIALIZATION_DATA: &str = "serialization.data";
    /// 只传输字节。
    pub const SERIALIZATION_BYTE: &str = "serialization.byte";
    /// 可靠传输。
    pub const COMMUNICATION_RELIABLE: &str = "communication.reliable";
    /// 单连接内先进先出。
    pub const COMMUNICATION_FIFO: &str = "communication.fifo";
    /// 每条消息携带按端口名递增的序号。
    pub const COMMUNICATION_NUMBERED: &str = "communication.numbered";
    /// 一对一。
    pub const CONNECTION_ONE_TO_ONE: &str = "connection.onetoone";
    /// 一个发送端口连接多个接收端口。
    pub const CONNECTION_ONE_TO_MANY: &str = "connection.onetomany";
    /// 多个发送端口连接同一个接收端口。
    pub const CONNECTION_MANY_TO_ONE: &str = "connection.manytoone";
    /// 多对多。
    pub const CONNECTION_MANY_TO_MANY: &str = "connection.manytomany";
    /// 以下行调用（轮询）方式获取连接增减。
    pub const CONNECTION_DOWNCALLS: &str = "connection.downcalls";
    /// 以上行调用方式获得连接增减通知。
    pub const CONNECTION_UPCALLS: &str = "connection.upcalls";
    /// 支持带超时的建连。
    pub const CONNECTION_TIMEOUT: &str = "connection.timeout";
    /// 显式阻塞接收。
    pub const RECEIVE_EXPLICIT: &str = "receive.explicit";
    /// 非阻塞轮询。
    pub const RECEIVE_POLL: &str = "receive.poll";
    /// 带超时的接收。
    pub const RECEIVE_TIMEOUT: &str = "receive.timeout";
    /// 自动消息上行调用。
    pub const RECEIVE_AUTO_UPCALLS: &str = "receive.autoupcalls";
    /// 由轮询驱动的消息上行调用。
    pub const RECEIVE_POLL_UPCALLS: &str = "receive.pollupcalls";
    /// 每连接一个阻塞线程。
    pub const IO_BLOCKING: &str = "io.blocking";
    /// 共享运行时上的多路复用。
    pub const IO_MULTIPLEXED: &str = "io.multiplexed";
    /// 单个专用收发线程。
    pub const IO_DEDICATED: &str = "io.dedicated";

    /// 本实现能够提供的全部能力。
    pub const ALL: &[&str] = &[
        SERIALIZATION_DATA,
        SERIALIZATION_BYTE,
        COMMUNICATION_RELIABLE,
        COMMUNICATION_FIFO,
        COMMUNICATION_NUMBERED,
        CONNECTION_ONE_TO_ONE,
        CONNECTION_ONE_TO_MANY,
        CONNECTION_MANY_TO_ONE,
        CONNECTION_MANY_TO_MANY,
        CONNECTION_DOWNCALLS,
        CONNECTION_UPCALLS,
        CONNECTION_TIMEOUT,
        RECEIVE_EXPLICIT,
        RECEIVE_POLL,
        RECEIVE_TIMEOUT,
        RECEIVE_AUTO_UPCALLS,
        RECEIVE_POLL_UPCALLS,
        IO_BLOCKING,
        IO_MULTIPLEXED,
        IO_DEDICATED,
    ];
}

/// 描述一条通信通道性质的能力集合。
///
/// 发送端口与接收端口必须以相等的端口类型创建，握手时不相等即拒绝。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PortType {
    capabilities: CapabilitySet,
}

impl PortType {
    /// 以能力标签构造端口类型。
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            capabilities: CapabilitySet::new(tokens),
        }
    }

    /// 从已有能力集合构造。
    pub fn from_capabilities(capabilities: CapabilitySet) -> Self {
        Self { capabilities }
    }

    /// 底层能力集合。
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// 是否具备某个能力。
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.has(capability)
    }

    /// 发送端口是否可以连接多个接收端口。
    pub fn allows_fan_out(&self) -> bool {
        self.has(caps::CONNECTION_ONE_TO_MANY) || self.has(caps::CONNECTION_MANY_TO_MANY)
    }

    /// 接收端口是否可以接受多个发送端口。
    pub fn allows_fan_in(&self) -> bool {
        self.has(caps::CONNECTION_MANY_TO_ONE) || self.has(caps::CONNECTION_MANY_TO_MANY)
    }

    /// 端口类型显式点名的 IO 策略。
    pub fn io_strategy(&self) -> Option<IoStrategy> {
        if self.has(caps::IO_BLOCKING) {
            Some(IoStrategy::Blocking)
        } else if self.has(caps::IO_DEDICATED) {
            Some(IoStrategy::Dedicated)
        } else if self.has(caps::IO_MULTIPLEXED) {
            Some(IoStrategy::Multiplexed)
        } else {
            None
        }
    }
}

impl fmt::Debug for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortType").field(&self.capabilities).finish()
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortType({})", self.capabilities)
    }
}
