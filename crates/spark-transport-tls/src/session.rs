use std::mem;

use spark_buffer::{BufferArena, PooledBuffer};
use tracing::debug;

use crate::{
    config::{BufferGrowth, SecureChannelConfig},
    engine::SessionSizes,
    error::TlsError,
};

/// 解析后的会话缓冲尺寸（引擎建议值叠加配置覆盖）。
///
/// - `net`：密文缓冲（入/出）的初始容量；
/// - `app`：明文缓冲的初始容量。
///
/// 两者同时是增长策略计算上限的基准。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSizes {
    pub net: usize,
    pub app: usize,
}

impl BufferSizes {
    /// 以引擎会话尺寸为基础，应用配置中的覆盖值。
    pub fn resolve(sizes: SessionSizes, config: &SecureChannelConfig) -> Self {
        Self {
            net: config.net_buffer_size.unwrap_or(sizes.packet),
            app: config.app_buffer_size.unwrap_or(sizes.application),
        }
    }
}

/// 握手完成后移交给安全通道的三块长期缓冲。
///
/// - `net_in`：尚未解密的密文；
/// - `net_out`：尚未写出的密文；
/// - `app_in`：已解密、尚未交付给调用方的明文。
///
/// 所有权以值的形式从握手模型移入通道的读/写两半，不存在别名。
#[derive(Debug)]
pub struct SessionBuffers {
    pub(crate) net_in: PooledBuffer,
    pub(crate) net_out: PooledBuffer,
    pub(crate) app_in: PooledBuffer,
}

impl SessionBuffers {
    /// 显式归还全部缓冲。
    pub fn release(self) {
        self.net_in.release();
        self.net_out.release();
        self.app_in.release();
    }
}

/// 按增长策略扩容 `buffer`，保留待处理字节。
///
/// 新区域从 `arena` 租借，待处理字节搬移到开头后归还旧区域；
/// 策略不允许或已达上限时返回 [`TlsError::BufferExhausted`]，`buffer` 保持原状。
pub(crate) fn grow(
    arena: &dyn BufferArena,
    buffer: &mut PooledBuffer,
    growth: BufferGrowth,
    initial: usize,
    region: &'static str,
) -> Result<(), TlsError> {
    let current = buffer.capacity();
    let next = growth
        .next_capacity(current, initial)
        .ok_or(TlsError::BufferExhausted {
            region,
            capacity: current,
        })?;
    let mut grown = arena.allocate(next)?;
    buffer.compact();
    grown.extend_from_slice(buffer.pending());
    let previous = mem::replace(buffer, grown);
    previous.release();
    debug!(region, from = current, to = next, "grew session buffer");
    Ok(())
}
