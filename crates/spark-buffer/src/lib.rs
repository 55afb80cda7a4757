//! `spark-buffer` 提供安全通道使用的定长池化缓冲（Buffer Arena）。
//!
//! # 模块定位（Why）
//! - TLS 记录引擎在每条连接上持有多块会话级缓冲（密文入/出、明文入），
//!   逐次分配会在高并发下放大堆抖动；池化后仅在首次租借时分配，之后复用。
//! - 缓冲区的所有权是显式的：每块 [`PooledBuffer`] 同一时刻只属于一个持有者，
//!   通过消耗 `self` 的 [`PooledBuffer::release`] 归还，二次释放在类型层面不可表达。
//!
//! # 设计概要（How）
//! - `pooled_buffer` 模块实现 `PooledBuffer`：固定容量区域 + `position`/`limit` 游标对；
//! - `pool` 模块实现 [`SlabBufferPool`]：`spin::Mutex<Vec<BytesMut>>` 自由链表 + 原子统计；
//! - 通过 [`BufferRecycler`] 将归还钩子显式化，池与缓冲之间保持松耦合。
//!
//! # 契约（What）
//! - [`BufferArena`] 是上层唯一依赖的接口：`allocate` 与 `statistics`；
//! - 所有公开类型均满足 `Send + Sync + 'static`，可被不同连接的任务并发使用。

mod error;
mod pool;
mod pooled_buffer;

pub use error::ArenaError;
pub use pool::{BufferArena, PoolStats, SlabBufferPool};
pub use pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};
