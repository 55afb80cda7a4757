use std::time::Duration;

use serde::Deserialize;

use crate::error::TlsError;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_EMPTY_UNWRAPS: u32 = 8;
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 16;
const DEFAULT_GROWTH_FACTOR_LIMIT: usize = 4;

/// 会话缓冲的增长策略。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎给出的会话尺寸通常足够，但对端可能发送超出预期的记录（扩展、超长证书链）；
///   此时“解密缓冲溢出”或“密文缓冲装满仍不足一条记录”要么扩容、要么立即失败，不能无界空转。
///
/// ## 契约（What）
/// - `Fixed`：从不扩容，遇到上述情况返回 [`TlsError::BufferExhausted`]；
/// - `Double`：容量翻倍（从池中重新租借、搬移待处理字节、归还旧区域），
///   直到 `max_capacity`；未配置上限时取初始容量的 4 倍。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferGrowth {
    Fixed,
    Double {
        #[serde(default)]
        max_capacity: Option<usize>,
    },
}

impl Default for BufferGrowth {
    fn default() -> Self {
        Self::Double { max_capacity: None }
    }
}

impl BufferGrowth {
    /// 以 `initial` 为基准计算下一档容量；返回 `None` 表示不能再增长。
    pub fn next_capacity(&self, current: usize, initial: usize) -> Option<usize> {
        match *self {
            Self::Fixed => None,
            Self::Double { max_capacity } => {
                let limit =
                    max_capacity.unwrap_or_else(|| initial.saturating_mul(DEFAULT_GROWTH_FACTOR_LIMIT));
                let next = current.saturating_mul(2).min(limit);
                (next > current).then_some(next)
            }
        }
    }
}

/// 委派任务的执行位置。
///
/// - `Inline`：在驱动握手的任务上直接执行，适合任务确定很短的引擎；
/// - `Blocking`：投递到 Tokio 阻塞线程池，以信号量限制同时执行的任务数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskExecution {
    Inline,
    Blocking {
        #[serde(default = "default_max_concurrent")]
        max_concurrent: usize,
    },
}

impl Default for TaskExecution {
    fn default() -> Self {
        Self::Blocking {
            max_concurrent: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

/// 安全通道配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 超时、重试上界、缓冲尺寸与增长策略都会影响“卡死还是失败”的边界，
///   集中在一个可从 TOML 加载的结构里，运维可按部署调整而无需改代码。
///
/// ## 契约（What）
/// - `handshake_timeout_ms`：握手整体时限，超时以 [`TlsError::Timeout`] 结束握手；
/// - `read_timeout_ms` / `write_timeout_ms`：调用方未显式传入超时时使用；
/// - `max_empty_unwraps`：连续“解密成功但无明文输出”的重试上界；
/// - `net_buffer_size` / `app_buffer_size`：覆盖引擎给出的会话尺寸；
/// - `send_close_notify`：关闭时是否尽力发送 `close_notify` 记录。
///
/// ## 注意事项（Trade-offs）
/// - 所有字段均有默认值，空 TOML 文档即得到默认配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecureChannelConfig {
    pub handshake_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub max_empty_unwraps: u32,
    pub net_buffer_size: Option<usize>,
    pub app_buffer_size: Option<usize>,
    pub growth: BufferGrowth,
    pub task_execution: TaskExecution,
    pub send_close_notify: bool,
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Some(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            read_timeout_ms: None,
            write_timeout_ms: None,
            max_empty_unwraps: DEFAULT_MAX_EMPTY_UNWRAPS,
            net_buffer_size: None,
            app_buffer_size: None,
            growth: BufferGrowth::default(),
            task_execution: TaskExecution::default(),
            send_close_notify: true,
        }
    }
}

impl SecureChannelConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, TlsError> {
        let config: Self =
            toml::from_str(raw).map_err(|error| TlsError::Config(error.to_string().into()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.net_buffer_size == Some(0) || self.app_buffer_size == Some(0) {
            return Err(TlsError::Config("buffer sizes must be non-zero".into()));
        }
        if let BufferGrowth::Double {
            max_capacity: Some(0),
        } = self.growth
        {
            return Err(TlsError::Config("growth max_capacity must be non-zero".into()));
        }
        if let TaskExecution::Blocking { max_concurrent: 0 } = self.task_execution {
            return Err(TlsError::Config(
                "task_execution max_concurrent must be non-zero".into(),
            ));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(TlsError::Config("handshake_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// 握手时限。
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// 默认读超时。
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// 默认写超时。
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SecureChannelConfig::from_toml_str("").expect("空配置应可解析");
        assert_eq!(config, SecureChannelConfig::default());
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.max_empty_unwraps, 8);
        assert!(config.send_close_notify);
    }

    #[test]
    fn tagged_policies_are_parsed() {
        let config = SecureChannelConfig::from_toml_str(
            r#"
            read_timeout_ms = 250
            max_empty_unwraps = 2
            net_buffer_size = 4096

            [growth]
            kind = "double"
            max_capacity = 65536

            [task_execution]
            kind = "inline"
            "#,
        )
        .expect("配置应可解析");
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.net_buffer_size, Some(4096));
        assert_eq!(
            config.growth,
            BufferGrowth::Double {
                max_capacity: Some(65_536)
            }
        );
        assert_eq!(config.task_execution, TaskExecution::Inline);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let error = SecureChannelConfig::from_toml_str(
            r#"
            [task_execution]
            kind = "blocking"
            max_concurrent = 0
            "#,
        )
        .expect_err("并发上限为 0 应被拒绝");
        assert_eq!(error.code(), "spark.transport.tls.invalid_config");

        let error = SecureChannelConfig::from_toml_str("growth = 3")
            .expect_err("类型错误应被拒绝");
        assert_eq!(error.code(), "spark.transport.tls.invalid_config");
    }

    #[test]
    fn doubling_stops_at_the_limit() {
        let growth = BufferGrowth::Double { max_capacity: None };
        assert_eq!(growth.next_capacity(100, 100), Some(200));
        assert_eq!(growth.next_capacity(200, 100), Some(400));
        assert_eq!(growth.next_capacity(400, 100), None);
        assert_eq!(BufferGrowth::Fixed.next_capacity(100, 100), None);
    }
}
