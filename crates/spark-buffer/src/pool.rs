use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::{
    error::ArenaError,
    pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer},
};

/// 安全通道依赖的缓冲分配契约。
///
/// # 契约说明（What）
/// - `allocate`：返回容量恰为 `capacity` 的独占缓冲，游标均为 0；
/// - `statistics`：返回一次性快照，供测试与运维核对“租借/归还”是否配平；
/// - 实现必须允许不同连接并发调用，调用方无需额外加锁。
pub trait BufferArena: Send + Sync + 'static {
    /// 租借一块定长区域。
    fn allocate(&self, capacity: usize) -> Result<PooledBuffer, ArenaError>;

    /// 读取统计快照。
    fn statistics(&self) -> PoolStats;
}

/// 缓冲池统计快照。
///
/// - `allocations` / `releases`：累计租借次数与显式归还次数；
/// - `implicit_releases`：未经 `release` 直接丢弃的次数，正常运行时应为 0；
/// - `failed_allocations`：因超出单块上限被拒绝的租借次数；
/// - `active_leases`：当前在外的租约数量；
/// - `allocated_bytes`：池向堆申请过且仍驻留的字节数；
/// - `available_bytes`：自由链表中等待复用的字节数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub releases: u64,
    pub implicit_releases: u64,
    pub failed_allocations: u64,
    pub active_leases: usize,
    pub allocated_bytes: usize,
    pub available_bytes: usize,
}

/// `SlabBufferPool` 提供基于自由链表（Free List）的缓冲池实现，
/// 专注在**高并发、低延迟**场景下复用 `BytesMut`，以减少堆分配次数。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用容量足够的块；
/// - `PoolMetrics` 以原子计数跟踪租借、归还与字节占用，支撑 [`BufferArena::statistics`]；
/// - `BufferRecycler` 实现接收 [`ReclaimedBuffer`]，更新统计后把 `BytesMut` 放回链表。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态均由 `spin::Mutex` 与原子计数保护；
/// - **后置条件**：`allocate` 返回的缓冲 `capacity() == capacity` 且内容清零；
/// - 可选的单块上限（[`SlabBufferPool::with_max_capacity`]）用于约束增长策略的最坏情况。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非 `parking_lot::Mutex`，临界区仅包含一次线性查找与 `swap_remove`；
/// - `shrink_to_fit` 采取“清空自由链表”的简单策略，便于在压测后快速归还峰值内存。
#[derive(Clone)]
pub struct SlabBufferPool {
    inner: Arc<PoolInner>,
}

impl Default for SlabBufferPool {
    fn default() -> Self {
        Self {
            inner: Arc::new(PoolInner::new(None)),
        }
    }
}

impl SlabBufferPool {
    /// 创建空池实例。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带单块容量上限的池。
    pub fn with_max_capacity(limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(Some(limit))),
        }
    }

    /// 清空自由链表，返回归还给系统的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }
}

impl BufferArena for SlabBufferPool {
    fn allocate(&self, capacity: usize) -> Result<PooledBuffer, ArenaError> {
        if capacity == 0 {
            return Err(ArenaError::ZeroCapacity);
        }
        if let Some(limit) = self.inner.max_capacity
            && capacity > limit
        {
            self.inner
                .metrics
                .failed_acquisitions
                .fetch_add(1, Ordering::Relaxed);
            return Err(ArenaError::CapacityLimit {
                requested: capacity,
                limit,
            });
        }
        let region = self.inner.acquire_region(capacity);
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        Ok(PooledBuffer::new(region, recycler))
    }

    fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
    max_capacity: Option<usize>,
}

impl PoolInner {
    fn new(max_capacity: Option<usize>) -> Self {
        Self {
            free_list: Mutex::new(Vec::new()),
            metrics: PoolMetrics::default(),
            max_capacity,
        }
    }

    /// 从自由链表或堆上获取一个长度恰为 `capacity` 且已清零的区域。
    fn acquire_region(&self, capacity: usize) -> BytesMut {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= capacity)
                .map(|index| list.swap_remove(index))
        };

        let mut region = match reused {
            Some(buf) => {
                self.metrics.decrease_available(buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(capacity);
                self.metrics.increase_on_new_allocation(buf.capacity());
                buf
            }
        };
        region.clear();
        region.resize(capacity, 0);
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);
        region
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        self.metrics.decrease_available(reclaimed);
        saturating_sub(&self.metrics.allocated_bytes, reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocations: self.metrics.allocations.load(Ordering::Relaxed),
            releases: self.metrics.releases.load(Ordering::Relaxed),
            implicit_releases: self.metrics.implicit_releases.load(Ordering::Relaxed),
            failed_allocations: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        saturating_sub(&self.metrics.active_leases, 1);
        if reclaimed.is_explicit() {
            self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.implicit_releases.fetch_add(1, Ordering::Relaxed);
        }
        let mut buf = reclaimed.into_buffer();
        buf.clear();
        self.metrics.increase_available(buf.capacity());
        self.free_list.lock().push(buf);
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocations: AtomicU64,
    releases: AtomicU64,
    implicit_releases: AtomicU64,
    failed_acquisitions: AtomicU64,
    active_leases: AtomicUsize,
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusable_capacity_returns_to_pool() {
        let pool = SlabBufferPool::new();
        let mut first = pool.allocate(64).expect("租借缓冲失败");
        first.extend_from_slice(&[1, 2, 3, 4]);
        first.release();

        let snapshot = pool.statistics();
        assert!(snapshot.available_bytes >= 64);

        let second = pool.allocate(16).expect("复用缓冲失败");
        assert_eq!(second.capacity(), 16);
        assert!(second.pending().is_empty());
        let after = pool.statistics();
        assert_eq!(after.allocated_bytes, snapshot.allocated_bytes);
        second.release();
    }

    #[test]
    fn reused_region_is_zeroed() {
        let pool = SlabBufferPool::new();
        let mut dirty = pool.allocate(8).expect("租借缓冲失败");
        dirty.extend_from_slice(&[0xAA; 8]);
        dirty.release();

        let mut clean = pool.allocate(8).expect("复用缓冲失败");
        assert!(clean.spare_mut().iter().all(|byte| *byte == 0));
        clean.release();
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let pool = SlabBufferPool::with_max_capacity(32);
        assert_eq!(
            pool.allocate(33).expect_err("超过上限应失败"),
            ArenaError::CapacityLimit {
                requested: 33,
                limit: 32
            }
        );
        assert_eq!(
            pool.allocate(0).expect_err("零容量应失败"),
            ArenaError::ZeroCapacity
        );
        let stats = pool.statistics();
        assert_eq!(stats.active_leases, 0);
        assert_eq!(stats.failed_allocations, 1);
    }
}
