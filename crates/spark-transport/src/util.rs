use std::{
    future::Future,
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::sync::Notify;

use crate::error::{Operation, TransportError};

/// 在可选时限内执行一次 IO Future，并把错误映射为 [`TransportError`]。
///
/// # 契约（What）
/// - `timeout == None`：直接等待 `future` 完成；
/// - `timeout == Some(d)`：超过 `d` 后丢弃 `future` 并返回 `TransportError::Timeout`；
///   被丢弃的 Future 不会留下半完成的副作用以外的状态，调用方可以安全重试。
pub async fn with_timeout<F, T>(
    operation: Operation,
    timeout: Option<Duration>,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match timeout {
        Some(after) => match tokio::time::timeout(after, future).await {
            Ok(result) => result,
            Err(_) => return Err(TransportError::Timeout { operation, after }),
        },
        None => future.await,
    };
    result.map_err(|error| TransportError::io(operation, error))
}

/// 通道级关闭信号：一次性地把“已关闭”广播给所有在途操作。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对端迟迟不发数据时，在途读会一直挂起；本端 `close` 必须能把它唤醒，
///   否则读方持有的缓冲与锁会比通道本身活得更久。
///
/// ## 逻辑（How）
/// - `closed` 标志负责“关闭之后才开始的操作”，`Notify` 负责“关闭之前已经在等待的操作”；
/// - [`CloseSignal::guard`] 先登记唤醒、再检查标志，两者之间不存在遗漏窗口；
/// - `select!` 使用 `biased`，关闭优先于操作本身的结果。
///
/// ## 契约（What）
/// - `close` 只在首次调用时返回 `true`；
/// - `guard` 在关闭后返回 `None`，被中止的 Future 随之丢弃。
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 置位并唤醒全部在途操作，返回本次调用是否完成了状态切换。
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// 运行 `future`，直到它完成或通道被关闭。
    pub async fn guard<F: Future>(&self, future: F) -> Option<F::Output> {
        let closed = self.notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = &mut closed => None,
            output = future => Some(output),
        }
    }
}
