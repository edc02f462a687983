//! 上行调用接口。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 接收端口可以把消息递交给回调而非等待显式接收；连接的增减同样可以回调通知；
//! - 上行调用运行在端口自己的投递线程上，回调里再对同一端口做阻塞 IO 会卡死唯一能推进
//!   投递的线程，因此默认禁止，需要时由配置放开。
//!
//! ## 契约（What）
//! - 同一端口任一时刻至多一个消息上行调用处于活动状态；
//! - 回调返回 `Err` 时，端口拆除该消息所属的连接并以该错误为原因发出丢失通知；
//! - 闭包可以直接充当 [`MessageUpcall`]。

use std::cell::Cell;

use crate::{PortError, ReadMessage, ReceivePortId, SendPortId};

/// 消息上行调用。
pub trait MessageUpcall: Send + Sync + 'static {
    /// 处理一条消息；返回前可以调用 `finish` 提前释放端口。
    fn upcall(&self, message: &mut ReadMessage) -> Result<(), PortError>;
}

impl<F> MessageUpcall for F
where
    F: Fn(&mut ReadMessage) -> Result<(), PortError> + Send + Sync + 'static,
{
    fn upcall(&self, message: &mut ReadMessage) -> Result<(), PortError> {
        self(message)
    }
}

/// 接收端口的连接上行调用。
pub trait ReceivePortConnectUpcall: Send + Sync + 'static {
    /// 新的发送端口请求连接；返回 `false` 拒绝（应答 `DENIED`）。
    fn got_connection(&self, port: &ReceivePortId, origin: &SendPortId) -> bool;

    /// 连接结束；`cause` 为 `None` 表示对端正常关闭。
    fn lost_connection(&self, port: &ReceivePortId, origin: &SendPortId, cause: Option<&PortError>);
}

/// 发送端口的断连上行调用。
pub trait SendPortDisconnectUpcall: Send + Sync + 'static {
    /// 到 `target` 的连接因错误丢失。
    fn lost_connection(&self, port: &SendPortId, target: &ReceivePortId, cause: &PortError);
}

/// 端点级的连接观察者，供成员管理与故障检测层使用。
pub trait ConnectionObserver: Send + Sync + 'static {
    /// 接收端口接受了来自 `origin` 的连接。
    fn connection_gained(&self, origin: &SendPortId, target: &ReceivePortId) {
        let _ = (origin, target);
    }

    /// 接收端口上的连接结束。
    fn connection_lost(&self, origin: &SendPortId, target: &ReceivePortId, cause: Option<&PortError>) {
        let _ = (origin, target, cause);
    }

    /// 发送侧发现到 `target` 的连接失败。
    fn lost_connection_to(&self, target: &ReceivePortId, cause: &PortError) {
        let _ = (target, cause);
    }
}

thread_local! {
    static IN_UPCALL: Cell<bool> = const { Cell::new(false) };
}

/// 标记当前线程正处于未结束的消息上行调用中。
pub(crate) struct UpcallScope {
    previous: bool,
}

impl UpcallScope {
    pub(crate) fn enter() -> Self {
        Self {
            previous: IN_UPCALL.with(|flag| flag.replace(true)),
        }
    }

    /// 消息在回调内提前结束后，线程不再受限。
    pub(crate) fn leave_early() {
        IN_UPCALL.with(|flag| flag.set(false));
    }
}

impl Drop for UpcallScope {
    fn drop(&mut self) {
        IN_UPCALL.with(|flag| flag.set(self.previous));
    }
}

pub(crate) fn in_upcall() -> bool {
    IN_UPCALL.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_restores_the_flag() {
        assert!(!in_upcall());
        {
            let _scope = UpcallScope::enter();
            assert!(in_upcall());
            UpcallScope::leave_early();
            assert!(!in_upcall());
        }
        assert!(!in_upcall());
    }
}
