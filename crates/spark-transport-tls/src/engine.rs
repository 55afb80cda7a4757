use crate::error::TlsError;

/// 引擎委派出来的计算任务（例如密钥派生、证书校验）。
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// 单次 `wrap`/`unwrap` 的结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// 操作成功完成（可能没有产出字节）。
    Ok,
    /// 目标缓冲容量不足，未产出任何字节。
    BufferOverflow,
    /// 源缓冲不足以构成完整记录，需要更多输入。
    BufferUnderflow,
    /// 引擎已关闭对应方向。
    Closed,
}

/// 引擎在握手中的下一步诉求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// 需要调用 `wrap` 输出握手记录。
    NeedWrap,
    /// 需要调用 `unwrap` 消化对端的握手记录。
    NeedUnwrap,
    /// 需要先执行 [`TlsEngine::delegated_task`] 返回的任务。
    NeedTask,
    /// 恰好由本次操作完成了握手，只会出现在一次操作结果中。
    Finished,
    /// 会话已建立（或尚未开始握手）。
    NotHandshaking,
}

impl HandshakeStatus {
    /// 握手是否仍在进行。
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::NeedWrap | Self::NeedUnwrap | Self::NeedTask)
    }
}

/// `wrap`/`unwrap` 的完整结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    /// 构造结果。
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

/// 会话参数：用于确定缓冲尺寸。
///
/// - `application`：单条记录可承载的最大明文字节数；
/// - `packet`：单条记录加密后的最大字节数（含头部、认证标签与填充）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSizes {
    pub application: usize,
    pub packet: usize,
}

/// 可插拔 TLS 引擎契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手驱动与安全通道只依赖“加密一段 / 解密一段 / 询问下一步”三类能力，
///   证书装载、套件协商、记录加密全部留在引擎内部；
/// - 以同步、无 IO 的 trait 表达后，真实实现（[`RustlsEngine`](crate::RustlsEngine)）
///   与测试替身可以互换，异步 IO 全部由调用方负责。
///
/// ## 契约（What）
/// - `wrap(src, dst)`：把 `src` 的一个前缀加密写入 `dst` 开头；`src` 为空时仅输出握手/告警记录；
/// - `unwrap(src, dst)`：从 `src` 开头解析记录，把明文写入 `dst` 开头；
/// - 返回的 `bytes_consumed`/`bytes_produced` 精确反映游标应推进的长度；
/// - `BufferOverflow` 与 `BufferUnderflow` 不消耗任何输入；
/// - `handshake_status` 为 `NeedTask` 时，调用方必须先取尽 `delegated_task` 再继续；
/// - 引擎不是 `Sync`：同一时刻只允许一个调用者操作，由安全通道以互斥锁保证。
///
/// ## 风险提示（Trade-offs）
/// - `handshake_status` 以 `&self` 暴露，实现者需缓存最近一次的诉求，不能在查询时推进状态。
pub trait TlsEngine: Send + 'static {
    /// 进入握手阶段。
    fn begin_handshake(&mut self) -> Result<(), TlsError>;

    /// 加密。
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// 解密。
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// 当前握手诉求。
    fn handshake_status(&self) -> HandshakeStatus;

    /// 取出一个待执行任务，没有时返回 `None`。
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 通知引擎入站方向结束；对端未发送 `close_notify` 时返回错误（可能被截断）。
    fn close_inbound(&mut self) -> Result<(), TlsError>;

    /// 通知引擎出站方向结束，之后的 `wrap` 只会输出关闭告警。
    fn close_outbound(&mut self);

    /// 会话缓冲尺寸。
    fn session_sizes(&self) -> SessionSizes;

    /// 引擎内部是否还保留着已解密、尚未交付的明文。
    ///
    /// 提前解密的实现（例如一次性处理整段输入的引擎）必须覆盖此方法，
    /// 否则读路径会在“缓冲已空但引擎内仍有数据”时发起多余的网络读。
    fn has_buffered_plaintext(&mut self) -> bool {
        false
    }
}
