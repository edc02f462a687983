use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::{
    ByteOrder,
    frame::{FRAME_ALIGNMENT, MAX_SEGMENT_LEN, SEGMENT_COUNT},
    send_buffer::{FrozenFrame, SendBuffer},
};

/// 默认单段容量（字节）。
pub const DEFAULT_SEGMENT_CAPACITY: usize = 16 * 1024;
/// 默认保留的空闲槽位数量。
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// 缓冲池配置。
///
/// # 契约（What）
/// - `segment_capacity`：每个类型段的容量上限，写满即报告“缓冲已满”；会被规整到
///   `[8, MAX_SEGMENT_LEN]` 区间并向下对齐到 8，保证 16 位长度字段不会溢出；
/// - `cache_size`：空闲链表最多保留的存储数量，超出部分直接释放；
/// - `byte_order`：写入多字节值时使用的字节序，会写入每个帧头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub segment_capacity: usize,
    pub cache_size: usize,
    pub byte_order: ByteOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            cache_size: DEFAULT_CACHE_SIZE,
            byte_order: ByteOrder::native(),
        }
    }
}

impl PoolConfig {
    fn normalized(mut self) -> Self {
        let clamped = self.segment_capacity.clamp(FRAME_ALIGNMENT, MAX_SEGMENT_LEN);
        self.segment_capacity = clamped & !(FRAME_ALIGNMENT - 1);
        self
    }
}

/// 缓冲池的统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计新分配的段存储数量。
    pub allocated_storages: usize,
    /// 空闲链表中可直接复用的槽位。
    pub free_slots: usize,
    /// 正在写入的缓冲数量。
    pub active_writers: usize,
    /// 已翻转、尚有租约存活的帧数量。
    pub frames_in_flight: usize,
    /// 累计签发的副本租约数量。
    pub replicas_issued: u64,
    /// 累计回收进空闲链表的帧数量。
    pub recycled_frames: u64,
    /// 因空闲链表已满而直接释放的存储数量。
    pub discarded_storages: u64,
}

/// `SendBufferPool` 以槽位数组加空闲链表的方式复用发送缓冲。
///
/// # 模块角色（Why）
/// - 每条消息至少经历一次“写入 → 翻转 → 扇出 → 回收”，复用段存储可以避免在热路径上
///   反复分配 7 个段；
/// - 翻转后的帧可能同时被多条连接读取，需要按租约计数决定何时归还。
///
/// # 核心机制（How）
/// - `spin::Mutex<Arena>` 保护槽位数组：每个槽位处于 `Vacant`、`Free`、`Writing`、
///   `Frozen { refs }` 之一；
/// - 翻转时槽位进入 `Frozen { refs: 1 }`，每签发一个副本 `refs` 加一；租约释放时减一，
///   只有归零时才把段存储放回空闲链表（超过 `cache_size` 则直接丢弃）；
/// - 非最后一个租约在持锁期间放下自己的 `Arc`，因此最后一个租约总能以
///   `Arc::try_unwrap` 独占取回存储。
///
/// # 契约说明（What）
/// - **线程安全**：所有共享状态均由自旋锁与原子计数保护，满足 `Send + Sync + 'static`；
/// - **后置条件**：`acquire` 返回的缓冲所有段均为空，容量等于配置的段容量。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非阻塞锁：临界区只包含计数与指针搬移，持锁时间极短；
/// - 槽位数组只增不减，峰值之后的空槽以 `Vacant` 形式保留，下标可复用。
#[derive(Clone)]
pub struct SendBufferPool {
    inner: Arc<PoolInner>,
}

impl Default for SendBufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl core::fmt::Debug for SendBufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendBufferPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SendBufferPool {
    /// 以给定配置创建空池。
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(config.normalized())),
        }
    }

    /// 租借一个空的发送缓冲。
    pub fn acquire(&self) -> SendBuffer {
        let (slot, storage) = self.inner.acquire_slot();
        SendBuffer::new(Arc::clone(&self.inner), slot, storage)
    }

    /// 规整后的配置。
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

/// 一个缓冲的 7 个类型段。
#[derive(Default)]
pub(crate) struct FrameStorage {
    pub(crate) segments: [BytesMut; SEGMENT_COUNT],
}

impl FrameStorage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            segments: core::array::from_fn(|_| BytesMut::with_capacity(capacity)),
        }
    }

    fn clear(&mut self) {
        for segment in &mut self.segments {
            segment.clear();
        }
    }
}

enum Slot {
    Vacant,
    Free(FrameStorage),
    Writing,
    Frozen { refs: usize },
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    vacant: Vec<usize>,
}

impl Arena {
    /// 把槽位标记为空闲；空闲链表已满时丢弃存储。返回是否进入了空闲链表。
    fn retire(&mut self, slot: usize, mut storage: FrameStorage, cache_size: usize) -> bool {
        if self.free.len() < cache_size {
            storage.clear();
            self.slots[slot] = Slot::Free(storage);
            self.free.push(slot);
            true
        } else {
            self.slots[slot] = Slot::Vacant;
            self.vacant.push(slot);
            false
        }
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    arena: Mutex<Arena>,
    metrics: PoolMetrics,
    next_sequence: AtomicU64,
}

impl PoolInner {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            arena: Mutex::new(Arena::default()),
            metrics: PoolMetrics::default(),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// 优先复用空闲槽位，其次复用空槽下标，最后追加新槽位。
    fn acquire_slot(&self) -> (usize, FrameStorage) {
        let mut arena = self.arena.lock();
        self.metrics.active_writers.fetch_add(1, Ordering::Relaxed);
        while let Some(slot) = arena.free.pop() {
            if let Slot::Free(storage) = core::mem::replace(&mut arena.slots[slot], Slot::Writing)
            {
                return (slot, storage);
            }
            tracing::warn!(slot, "free list pointed at a slot that was not free");
        }
        let slot = match arena.vacant.pop() {
            Some(slot) => slot,
            None => {
                arena.slots.push(Slot::Vacant);
                arena.slots.len() - 1
            }
        };
        arena.slots[slot] = Slot::Writing;
        drop(arena);
        self.metrics.allocated_storages.fetch_add(1, Ordering::Relaxed);
        (slot, FrameStorage::with_capacity(self.config.segment_capacity))
    }

    /// 未翻转即丢弃的缓冲把存储还给池。
    pub(crate) fn discard_writing(&self, slot: usize, storage: FrameStorage) {
        let mut arena = self.arena.lock();
        saturating_dec(&self.metrics.active_writers);
        if !arena.retire(slot, storage, self.config.cache_size) {
            self.metrics.discarded_storages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 翻转：槽位进入 `Frozen { refs: 1 }`。
    pub(crate) fn freeze(&self, slot: usize) -> u64 {
        let mut arena = self.arena.lock();
        arena.slots[slot] = Slot::Frozen { refs: 1 };
        saturating_dec(&self.metrics.active_writers);
        self.metrics.frames_in_flight.fetch_add(1, Ordering::Relaxed);
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// 为帧签发 `count` 个副本。
    pub(crate) fn replicate(&self, slot: usize, frame: &Arc<FrozenFrame>, count: usize) -> Vec<Arc<FrozenFrame>> {
        let mut arena = self.arena.lock();
        match &mut arena.slots[slot] {
            Slot::Frozen { refs } => *refs += count,
            _ => {
                tracing::warn!(slot, "replicating a frame whose slot is not frozen");
            }
        }
        self.metrics
            .replicas_issued
            .fetch_add(count as u64, Ordering::Relaxed);
        (0..count).map(|_| Arc::clone(frame)).collect()
    }

    /// 释放一个租约。只有最后一个租约会真正回收存储。
    pub(crate) fn release(&self, slot: usize, frame: Arc<FrozenFrame>) {
        let mut arena = self.arena.lock();
        let remaining = match &mut arena.slots[slot] {
            Slot::Frozen { refs } => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            _ => {
                tracing::warn!(slot, "releasing a lease whose slot is not frozen");
                return;
            }
        };
        if remaining > 0 {
            // 在锁内放下引用，保证最后一个租约看到的是唯一的 `Arc`。
            drop(frame);
            return;
        }
        saturating_dec(&self.metrics.frames_in_flight);
        match Arc::try_unwrap(frame) {
            Ok(frozen) => {
                if arena.retire(slot, frozen.storage, self.config.cache_size) {
                    self.metrics.recycled_frames.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.discarded_storages.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                arena.slots[slot] = Slot::Vacant;
                arena.vacant.push(slot);
                self.metrics.discarded_storages.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 若当前租约是唯一持有者，把帧解冻为可写缓冲。
    pub(crate) fn thaw(
        &self,
        slot: usize,
        frame: Arc<FrozenFrame>,
    ) -> Result<FrameStorage, Arc<FrozenFrame>> {
        let mut arena = self.arena.lock();
        if !matches!(arena.slots[slot], Slot::Frozen { refs: 1 }) {
            return Err(frame);
        }
        match Arc::try_unwrap(frame) {
            Ok(frozen) => {
                arena.slots[slot] = Slot::Writing;
                saturating_dec(&self.metrics.frames_in_flight);
                self.metrics.active_writers.fetch_add(1, Ordering::Relaxed);
                let mut storage = frozen.storage;
                storage.clear();
                Ok(storage)
            }
            Err(frame) => Err(frame),
        }
    }

    fn snapshot(&self) -> PoolStats {
        let free_slots = self.arena.lock().free.len();
        PoolStats {
            allocated_storages: self.metrics.allocated_storages.load(Ordering::Relaxed),
            free_slots,
            active_writers: self.metrics.active_writers.load(Ordering::Relaxed),
            frames_in_flight: self.metrics.frames_in_flight.load(Ordering::Relaxed),
            replicas_issued: self.metrics.replicas_issued.load(Ordering::Relaxed),
            recycled_frames: self.metrics.recycled_frames.load(Ordering::Relaxed),
            discarded_storages: self.metrics.discarded_storages.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_storages: AtomicUsize,
    active_writers: AtomicUsize,
    frames_in_flight: AtomicUsize,
    replicas_issued: AtomicU64,
    recycled_frames: AtomicU64,
    discarded_storages: AtomicU64,
}

fn saturating_dec(target: &AtomicUsize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(1))
    });
}
