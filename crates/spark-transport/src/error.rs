use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// 描述一次通道操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub code: &'static str,
    pub message: &'static str,
}

pub const READ: Operation = Operation {
    code: "spark.transport.read_failed",
    message: "transport read",
};

pub const WRITE: Operation = Operation {
    code: "spark.transport.write_failed",
    message: "transport write",
};

pub const CONNECT: Operation = Operation {
    code: "spark.transport.connect_failed",
    message: "transport connect",
};

pub const CLOSE: Operation = Operation {
    code: "spark.transport.close_failed",
    message: "transport close",
};

const TIMEOUT_CODE: &str = "spark.transport.timeout";
const CLOSED_CODE: &str = "spark.transport.closed";

/// 底层通道错误。
///
/// # 契约（What）
/// - `Io`：底层 IO 失败，保留原始 `io::Error`（以 `Arc` 持有，使错误可克隆后广播给多个等待者）；
/// - `Timeout`：操作在给定时限内未完成；
/// - `Closed`：通道已被本端关闭，操作未触碰底层资源。
///
/// EOF 不是错误：`read` 以 `Ok(0)` 报告。
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{}: {source}", .operation.message)]
    Io {
        operation: Operation,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("{} timed out after {after:?}", .operation.message)]
    Timeout { operation: Operation, after: Duration },
    #[error("{} on closed channel", .operation.message)]
    Closed { operation: Operation },
}

impl TransportError {
    /// 将 `io::Error` 包装为结构化错误。
    pub fn io(operation: Operation, error: io::Error) -> Self {
        Self::Io {
            operation,
            source: Arc::new(error),
        }
    }

    /// 稳定错误码，供日志与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { operation, .. } => operation.code,
            Self::Timeout { .. } => TIMEOUT_CODE,
            Self::Closed { .. } => CLOSED_CODE,
        }
    }

    /// 出错的操作。
    pub fn operation(&self) -> Operation {
        match self {
            Self::Io { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Closed { operation } => *operation,
        }
    }

    /// 是否为超时。
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 调用方在不重建连接的情况下重试是否有意义。
    ///
    /// 超时与 `WouldBlock`/`Interrupted` 视作瞬时故障；连接级错误与本端关闭不可重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            Self::Closed { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_operation_and_kind() {
        let io = TransportError::io(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(io.code(), "spark.transport.read_failed");
        assert!(!io.is_retryable());
        assert!(io.to_string().starts_with("transport read: "));

        let timeout = TransportError::Timeout {
            operation: WRITE,
            after: Duration::from_millis(5),
        };
        assert_eq!(timeout.code(), "spark.transport.timeout");
        assert!(timeout.is_retryable());
        assert_eq!(timeout.operation(), WRITE);

        let closed = TransportError::Closed { operation: CLOSE };
        assert_eq!(closed.code(), "spark.transport.closed");
        assert_eq!(closed.to_string(), "transport close on closed channel");
    }
}
