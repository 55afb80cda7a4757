#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-tls

## 设计动机（Why）
- **可插拔引擎**：TLS 记录加解密由 [`TlsEngine`] 契约承载，握手驱动与安全通道只依赖 wrap/unwrap 与握手诉求，
  真实实现 [`RustlsEngine`] 与测试替身可以互换；
- **不阻塞执行上下文**：握手与稳态读写全部以 `async` 状态机表达，委派任务可投递到受限的阻塞线程池；
- **即插即用**：[`SecureChannel`] 自身实现 [`Transport`](spark_transport::Transport)，
  对上层协议而言与明文通道形状一致。

## 核心契约（What）
- [`HandshakeDriver`]：驱动一次握手到完成或失败，回调恰好触发一次；
- [`HandshakeModel`]：握手期的四块缓冲，成功后以 [`SessionBuffers`] 按值移交给通道；
- [`SecureChannel`]：握手闸门、稳态读（明文 → 残留密文 → 网络读）、自适应分片写、幂等关闭；
- [`TlsError`]：稳定错误码 `spark.transport.tls.*` 与 [`TlsErrorKind`] 分类。

## 实现策略（How）
- 缓冲来自 [`spark_buffer::BufferArena`]，归还以消耗所有权的 `release` 表达；
- 引擎以同步互斥锁保护，锁从不跨越 `await`；
- 配置集中在 [`SecureChannelConfig`]，可从 TOML 加载；日志经由 `tracing` 输出。

## 风险与考量（Trade-offs）
- 不支持重协商：握手完成后 `handshaking` 不会再变为真；
- 增长策略为 `Fixed` 时，超出会话尺寸的记录会直接失败而非扩容。
"#]

mod channel;
mod config;
mod engine;
mod error;
mod handshake;
mod rustls_engine;
mod session;
mod task;

pub use channel::{ChannelStats, SecureChannel, SecureChannelBuilder};
pub use config::{BufferGrowth, SecureChannelConfig, TaskExecution};
pub use engine::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, SessionSizes, TlsEngine,
};
pub use error::{EngineFailure, TlsError, TlsErrorKind};
pub use handshake::{HandshakeCallback, HandshakeDriver, HandshakeModel, HandshakeOptions};
pub use rustls_engine::RustlsEngine;
pub use session::{BufferSizes, SessionBuffers};
pub use task::TaskPool;
