use std::{borrow::Cow, future::Future, time::Duration};

/// 统一的异步字节通道能力接口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS 握手驱动与安全通道只需要“把字节读进缓冲 / 把缓冲写出去 / 关闭”三种能力；
///   把它们抽象为 trait 后，引擎逻辑对 TCP、内存管道或另一层加密通道一视同仁。
/// - 安全通道自身也实现本 trait，从而成为底层通道的即插即用替身。
///
/// ## 契约说明（What）
/// - `read`：读取至多 `buf.len()` 字节；`Ok(0)`（且 `buf` 非空）表示对端已结束写方向（EOF）；
/// - `write`：写出 `buf` 的一个前缀并返回其长度，调用方负责循环写完剩余部分；
/// - `close`：幂等关闭；之后的 `read`/`write` 必须返回错误且不得再触碰底层资源；
/// - `timeout`：`Some(d)` 表示该次操作的最长等待时间，`None` 表示不设上限；
/// - **并发约束**：同一时刻至多一个在途 `read` 与一个在途 `write`，两者可以并行。
///
/// ## 风险提示（Trade-offs）
/// - Future 类型以关联类型（GAT）暴露，实现者可返回零成本的具体 Future，
///   代价是 trait 不再对象安全；需要擦除类型时可在外层包装 `Pin<Box<dyn Future>>`。
pub trait Transport: Send + Sync + 'static {
    /// 通道特定的错误类型。
    type Error: std::error::Error + Send + Sync + 'static;

    /// 读操作返回的 Future。
    type ReadFuture<'a>: Future<Output = Result<usize, Self::Error>> + Send + 'a
    where
        Self: 'a;

    /// 写操作返回的 Future。
    type WriteFuture<'a>: Future<Output = Result<usize, Self::Error>> + Send + 'a
    where
        Self: 'a;

    /// 关闭操作返回的 Future。
    type CloseFuture<'a>: Future<Output = Result<(), Self::Error>> + Send + 'a
    where
        Self: 'a;

    /// 返回可用于日志或追踪的通道标识。
    fn id(&self) -> Cow<'_, str>;

    /// 读取数据到缓冲区。
    fn read<'a>(&'a self, buf: &'a mut [u8], timeout: Option<Duration>) -> Self::ReadFuture<'a>;

    /// 写出缓冲区的一个前缀。
    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> Self::WriteFuture<'a>;

    /// 关闭通道。
    fn close(&self) -> Self::CloseFuture<'_>;
}
