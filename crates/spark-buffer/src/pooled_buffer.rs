use std::{fmt, sync::Arc};

use bytes::BytesMut;

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - [`BufferArena`](crate::BufferArena) 只约束“租借”侧；归还容量的方式由具体池决定。
/// - 把回收钩子注入 [`PooledBuffer`]，归还路径就集中在一处，不会散落在 TLS 引擎的各个分支里。
///
/// # 契约定义（What）
/// - **前置条件**：实现必须线程安全，且调用过程中不得 panic，
///   否则 `Drop` 路径上的 panic 将导致进程异常终止。
/// - **后置条件**：每块缓冲恰好触发一次 `reclaim`。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 接收一次归还。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 表示一次回收动作所携带的上下文。
///
/// # 数据结构解析（How）
/// - `capacity`：租约容量（调用方请求的定长尺寸）；
/// - `buffer`：底层 `BytesMut`，池可放回自由链表复用；
/// - `explicit`：是否经由 [`PooledBuffer::release`] 显式归还。为 `false` 表示持有者
///   直接丢弃了缓冲，池仍会回收内存，但会把它计入泄漏统计，便于测试发现遗漏的 `release`。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    buffer: BytesMut,
    explicit: bool,
}

impl ReclaimedBuffer {
    /// 返回本次回收的容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 是否通过显式 `release` 归还。
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// 消耗结构并返回可复用的 `BytesMut`。
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

/// `PooledBuffer`：固定容量的字节区域，带 `position`/`limit` 游标对。
///
/// # 设计动机（Why）
/// - TLS 记录引擎需要同时表达“已消费 / 待处理 / 可写入”三段区间：
///   `[0, position)` 已被消费，`[position, limit)` 为待处理字节，`[limit, capacity)` 为空闲空间。
/// - 与“flip”式单游标相比，双游标让读路径与写路径无需来回切换模式，网络读写与解密可直接对接。
///
/// # 契约说明（What）
/// - `capacity` 在整个租约内不变；需要更大区域时由调用方重新租借，`compact` 后以 `extend_from_slice` 搬移待处理字节。
/// - `release` 消耗 `self`，因此“释放后再访问”与“重复释放”都无法通过编译。
/// - 若持有者未调用 `release` 就丢弃缓冲，`Drop` 仍会归还内存，但会被标记为隐式归还。
///
/// # 风险与取舍（Trade-offs）
/// - 区域在租借时以 0 填充，避免把上一个租户的残留字节暴露给新的持有者；代价是一次 `memset`。
pub struct PooledBuffer {
    region: BytesMut,
    position: usize,
    limit: usize,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl PooledBuffer {
    /// 以池分配的区域和回收句柄构造缓冲。
    ///
    /// # 前置条件
    /// - `region.len()` 即为租约容量，且已被清零；
    /// - `recycler` 与池的生命周期至少与缓冲等长。
    pub fn new(region: BytesMut, recycler: Arc<dyn BufferRecycler>) -> Self {
        Self {
            region,
            position: 0,
            limit: 0,
            recycler: Some(recycler),
        }
    }

    /// 区域总容量。
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// 已消费游标。
    pub fn position(&self) -> usize {
        self.position
    }

    /// 待处理区间的上界。
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 待处理字节数（`limit - position`）。
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// 是否还有待处理字节。
    pub fn has_remaining(&self) -> bool {
        self.limit > self.position
    }

    /// `limit` 之后的空闲字节数。
    pub fn spare_capacity(&self) -> usize {
        self.capacity() - self.limit
    }

    /// 是否已无空闲空间。
    pub fn is_full(&self) -> bool {
        self.limit == self.capacity()
    }

    /// 待处理字节视图。
    pub fn pending(&self) -> &[u8] {
        &self.region[self.position..self.limit]
    }

    /// 空闲区域的可写视图，写入后需调用 [`PooledBuffer::commit`]。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.region[self.limit..]
    }

    /// 标记前 `len` 个待处理字节已被消费。
    ///
    /// 超出待处理区间的部分被截断，游标不会越过 `limit`。
    pub fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.remaining(), "consume beyond limit");
        self.position = (self.position + len).min(self.limit);
        if self.position == self.limit {
            self.position = 0;
            self.limit = 0;
        }
    }

    /// 把刚写入空闲区域的 `len` 个字节纳入待处理区间。
    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.spare_capacity(), "commit beyond capacity");
        self.limit = (self.limit + len).min(self.capacity());
    }

    /// 将待处理字节搬移到区域开头，腾出尾部空间。
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.region.copy_within(self.position..self.limit, 0);
        self.limit -= self.position;
        self.position = 0;
    }

    /// 丢弃全部待处理字节。
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// 复制尽可能多的待处理字节到 `dst`，返回复制长度并推进 `position`。
    pub fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let len = self.remaining().min(dst.len());
        dst[..len].copy_from_slice(&self.region[self.position..self.position + len]);
        self.consume(len);
        len
    }

    /// 把 `src` 中能容纳的前缀追加到待处理区间，返回追加长度。
    pub fn extend_from_slice(&mut self, src: &[u8]) -> usize {
        let len = self.spare_capacity().min(src.len());
        let start = self.limit;
        self.region[start..start + len].copy_from_slice(&src[..len]);
        self.commit(len);
        len
    }

    /// 显式归还缓冲。
    pub fn release(mut self) {
        self.reclaim(true);
    }

    fn reclaim(&mut self, explicit: bool) {
        if let Some(recycler) = self.recycler.take() {
            let capacity = self.region.len();
            let buffer = core::mem::take(&mut self.region);
            recycler.reclaim(ReclaimedBuffer {
                capacity,
                buffer,
                explicit,
            });
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.reclaim(false);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}
