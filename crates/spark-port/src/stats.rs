//! 端口管理计数器。
//!
//! 计数器以原子量维护，读取时生成快照；名字与管理属性键一致，便于外部监控直接映射。

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::PortError;

/// 已完成的消息数。
pub const MESSAGES: &str = "Messages";
/// 已完成消息的负载字节数。
pub const MESSAGE_BYTES: &str = "MessageBytes";
/// 线上字节数（含控制字节与帧头）。
pub const BYTES: &str = "Bytes";
/// 建立过的连接数。
pub const CONNECTIONS: &str = "Connections";
/// 因错误丢失的连接数。
pub const LOST_CONNECTIONS: &str = "LostConnections";
/// 正常关闭的连接数。
pub const CLOSED_CONNECTIONS: &str = "ClosedConnections";

const NAMES: [&str; 6] = [
    MESSAGES,
    MESSAGE_BYTES,
    BYTES,
    CONNECTIONS,
    LOST_CONNECTIONS,
    CLOSED_CONNECTIONS,
];

#[derive(Debug, Default)]
pub(crate) struct PortCounters {
    values: [AtomicU64; 6],
}

impl PortCounters {
    fn slot(&self, name: &str) -> Option<&AtomicU64> {
        NAMES
            .iter()
            .position(|candidate| *candidate == name)
            .map(|index| &self.values[index])
    }

    pub(crate) fn add(&self, name: &'static str, delta: u64) {
        if let Some(slot) = self.slot(name) {
            slot.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<u64> {
        self.slot(name).map(|slot| slot.load(Ordering::Relaxed))
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, u64> {
        NAMES
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| ((*name).to_owned(), value.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn reset(&self, name: &str) -> Result<(), PortError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| PortError::configuration(format!("unknown management property `{name}`")))?;
        slot.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lists_every_counter() {
        let counters = PortCounters::default();
        counters.add(MESSAGES, 2);
        counters.add(BYTES, 64);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.len(), 6);
        assert_eq!(snapshot[MESSAGES], 2);
        assert_eq!(snapshot[BYTES], 64);
        assert_eq!(snapshot[LOST_CONNECTIONS], 0);
    }

    #[test]
    fn reset_targets_one_counter() {
        let counters = PortCounters::default();
        counters.add(MESSAGES, 3);
        counters.add(CONNECTIONS, 1);
        counters.reset(MESSAGES).expect("已知计数器可以重置");
        assert_eq!(counters.get(MESSAGES), Some(0));
        assert_eq!(counters.get(CONNECTIONS), Some(1));
        assert!(counters.reset("Nope").is_err());
    }
}
