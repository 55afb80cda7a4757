use thiserror::Error;

/// 缓冲池租借失败的原因。
///
/// # 契约（What）
/// - `ZeroCapacity`：请求容量为 0，池拒绝生成无法承载任何字节的区域；
/// - `CapacityLimit`：请求容量超过池配置的单块上限，调用方应调整会话尺寸或增长策略。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("buffer arena cannot allocate a zero-capacity region")]
    ZeroCapacity,
    #[error("requested capacity {requested} exceeds arena limit {limit}")]
    CapacityLimit { requested: usize, limit: usize },
}
