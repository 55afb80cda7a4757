use std::{borrow::Cow, error::Error as StdError, sync::Arc, time::Duration};

use spark_buffer::ArenaError;
use spark_transport::TransportError;
use thiserror::Error;

/// TLS 安全通道错误模型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把传输层、协议引擎、缓冲池三类来源的失败收敛到同一个可克隆的错误类型：
///   握手失败需要同时交给完成回调与所有等待握手的读写调用，因此错误必须能被复制广播。
/// - 提供稳定错误码与分类，调用方无需解析 TLS 引擎内部的状态码。
///
/// ## 逻辑（How）
/// - 各变体与错误分类一一对应（见 [`TlsErrorKind`]）；
/// - 外部错误源以 `Arc` 持有，满足 `Clone` 的同时保留 `source()` 链；
/// - [`TlsError::code`] 返回 `spark.transport.tls.*` 形式的稳定错误码。
///
/// ## 契约（What）
/// - 握手失败：`Handshake` / `Engine` / `Timeout`，由握手完成回调报告一次，不重试；
/// - 传输失败：`Transport`，对连接是终态，传播给在途的读或写；
/// - 协议异常：`Protocol`，表示引擎状态与调用约定不符，通常意味着缺陷；
/// - 关闭：`Closed`，本端已关闭或引擎已进入关闭态。
#[derive(Debug, Clone, Error)]
pub enum TlsError {
    #[error("tls handshake failed: {reason}")]
    Handshake { reason: Cow<'static, str> },
    #[error("tls engine rejected the session ({class:?}): {source}")]
    Engine {
        class: EngineFailure,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("tls protocol violation: {0}")]
    Protocol(Cow<'static, str>),
    #[error("tls session closed")]
    Closed,
    #[error("{region} buffer exhausted at {capacity} bytes")]
    BufferExhausted {
        region: &'static str,
        capacity: usize,
    },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("delegated engine task failed: {0}")]
    Task(Cow<'static, str>),
    #[error("invalid secure channel configuration: {0}")]
    Config(Cow<'static, str>),
}

/// 引擎拒绝会话时的细分原因，沿用证书/告警到安全类别的映射。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineFailure {
    /// 报文损坏、解密失败、对端违反协议。
    Integrity,
    /// 证书缺失或无效。
    Authentication,
    /// 对端明确拒绝访问。
    Authorization,
    /// 本地资源不足（随机数、时间源、缓冲上限）。
    Resource,
    /// 其它无法归类的失败。
    Other,
}

/// 错误分类，对应设计中的错误谱系。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsErrorKind {
    Handshake,
    Engine(EngineFailure),
    Transport,
    Timeout,
    Protocol,
    Closed,
    Resource,
    Config,
}

pub(crate) const HANDSHAKE_OPERATION: &str = "tls handshake";

impl TlsError {
    /// 构造握手失败。
    pub fn handshake(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    /// 构造协议异常。
    pub fn protocol(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol(reason.into())
    }

    /// 以任意错误源构造引擎失败。
    pub fn engine<E>(class: EngineFailure, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Engine {
            class,
            source: Arc::new(source),
        }
    }

    /// 错误分类。
    pub fn kind(&self) -> TlsErrorKind {
        match self {
            Self::Handshake { .. } => TlsErrorKind::Handshake,
            Self::Engine { class, .. } => TlsErrorKind::Engine(*class),
            Self::Transport(error) if error.is_timeout() => TlsErrorKind::Timeout,
            Self::Transport(_) => TlsErrorKind::Transport,
            Self::Timeout { .. } => TlsErrorKind::Timeout,
            Self::Protocol(_) => TlsErrorKind::Protocol,
            Self::Closed => TlsErrorKind::Closed,
            Self::BufferExhausted { .. } | Self::Arena(_) | Self::Task(_) => TlsErrorKind::Resource,
            Self::Config(_) => TlsErrorKind::Config,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "spark.transport.tls.handshake_failed",
            Self::Engine { .. } => "spark.transport.tls.engine_rejected",
            Self::Transport(error) => error.code(),
            Self::Timeout { .. } => "spark.transport.tls.timeout",
            Self::Protocol(_) => "spark.transport.tls.protocol_violation",
            Self::Closed => "spark.transport.tls.closed",
            Self::BufferExhausted { .. } => "spark.transport.tls.buffer_exhausted",
            Self::Arena(_) => "spark.transport.tls.arena_exhausted",
            Self::Task(_) => "spark.transport.tls.task_failed",
            Self::Config(_) => "spark.transport.tls.invalid_config",
        }
    }

    /// 是否为超时（握手整体超时或单次 IO 超时）。
    pub fn is_timeout(&self) -> bool {
        self.kind() == TlsErrorKind::Timeout
    }

    /// 稳态读写超时后缓冲状态保持不变，调用方可以原样重试；其余失败对连接均为终态。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_retryable(),
            _ => false,
        }
    }
}
