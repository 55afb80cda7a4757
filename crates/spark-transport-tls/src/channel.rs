use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use spark_buffer::{BufferArena, PooledBuffer, SlabBufferPool};
use spark_transport::{CloseSignal, Transport};
use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    config::SecureChannelConfig,
    engine::{EngineStatus, TlsEngine},
    error::{HANDSHAKE_OPERATION, TlsError},
    handshake::{HandshakeCallback, HandshakeDriver, HandshakeModel, HandshakeOptions},
    session::{BufferSizes, SessionBuffers, grow},
    task::TaskPool,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const UNBOUNDED_WRITE: usize = usize::MAX;

/// 握手闸门：记录唯一一次握手的结果。
enum HandshakeGate {
    Pending,
    Established,
    Failed(TlsError),
}

/// 读方向独占的会话状态。
struct ReadHalf {
    net_in: PooledBuffer,
    app_in: PooledBuffer,
    empty_unwraps: u32,
}

impl ReadHalf {
    fn release(self) {
        self.net_in.release();
        self.app_in.release();
    }
}

/// 写方向独占的会话状态。
struct WriteHalf {
    net_out: PooledBuffer,
}

/// 单次解密尝试的去向。
enum Unwrapped {
    Plaintext,
    Retry,
    NeedInput,
    EndOfStream,
}

#[derive(Default)]
struct Counters {
    handshake_completions: AtomicU64,
    wrap_overflows: AtomicU64,
    bytes_encrypted: AtomicU64,
    bytes_decrypted: AtomicU64,
}

/// 安全通道的运行统计快照。
///
/// - `adaptive_write_size`：`None` 表示尚未观察到 wrap 溢出，写入不分片；
/// - 其余字段为累计值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub handshake_completions: u64,
    pub wrap_overflows: u64,
    pub adaptive_write_size: Option<usize>,
    pub bytes_encrypted: u64,
    pub bytes_decrypted: u64,
}

/// 在任意 [`Transport`] 之上提供 TLS 加密的安全通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层协议只想要“读明文 / 写明文 / 关闭”，而 TLS 需要握手、记录拆分、密文缓冲与关闭告警；
///   `SecureChannel` 把这些细节收敛在内部，并自身实现 [`Transport`]，成为底层通道的即插即用替身。
///
/// ## 逻辑（How）
/// - **握手闸门**：首个 `read`/`write` 取得异步闸门并驱动 [`HandshakeDriver`]，
///   其余调用在闸门上等待并读取同一结果；失败结果是粘滞的，之后的调用直接返回同一错误；
/// - **稳态读**：严格按“已解密明文 → 残留密文解密 → 新的网络读”的优先级推进；
/// - **稳态写**：按自适应写尺寸分片加密，溢出时减半并记住新尺寸，每片密文写完才继续；
/// - **关闭**：幂等；通知引擎两个方向的关闭，尽力写出 `close_notify`，归还三块会话缓冲后关闭底层通道。
///
/// ## 契约（What）
/// - 同一时刻至多一个在途 `read` 与一个在途 `write`，两者可以并行；
/// - `read` 返回 `Ok(0)` 表示对端已结束（EOF 或 `close_notify`）；
/// - `write` 只在整段明文加密且密文全部写出后返回 `Ok(src.len())`；
/// - 稳态读写超时后缓冲状态原样保留，调用方可以重试；
/// - 首个 `read`/`write` 的时限同样约束隐式握手，握手超时属于粘滞失败。
///
/// ## 风险与权衡（Trade-offs）
/// - 引擎以同步互斥锁保护，锁只在单次 `wrap`/`unwrap` 期间持有，从不跨越 `await`；
/// - 关闭会打断在途读写（它们以 `Closed` 结束），`close` 在归还缓冲前等待它们释放各自的半边。
pub struct SecureChannel<T, E>
where
    T: Transport,
    E: TlsEngine,
{
    transport: T,
    engine: Mutex<E>,
    arena: Arc<dyn BufferArena>,
    config: SecureChannelConfig,
    sizes: BufferSizes,
    tasks: TaskPool,
    gate: AsyncMutex<HandshakeGate>,
    handshaking: AtomicBool,
    on_handshake: Mutex<Option<HandshakeCallback>>,
    reader: AsyncMutex<Option<ReadHalf>>,
    writer: AsyncMutex<Option<WriteHalf>>,
    adaptive_write_size: AtomicUsize,
    close_signal: CloseSignal,
    counters: Arc<Counters>,
}

/// [`SecureChannel`] 构建器。
pub struct SecureChannelBuilder<T, E> {
    transport: T,
    engine: E,
    arena: Option<Arc<dyn BufferArena>>,
    config: SecureChannelConfig,
    tasks: Option<TaskPool>,
    on_handshake: Option<HandshakeCallback>,
}

impl<T, E> SecureChannelBuilder<T, E>
where
    T: Transport,
    E: TlsEngine,
    TlsError: From<T::Error>,
{
    /// 指定缓冲池；未指定时为该通道单独创建一个 [`SlabBufferPool`]。
    pub fn arena(mut self, arena: Arc<dyn BufferArena>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// 指定配置。
    pub fn config(mut self, config: SecureChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// 在多条连接之间共享委派任务执行器；未指定时按配置新建。
    pub fn task_pool(mut self, tasks: TaskPool) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// 注册握手完成回调，恰好触发一次。
    pub fn on_handshake_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<(), TlsError>) + Send + 'static,
    {
        self.on_handshake = Some(Box::new(callback));
        self
    }

    /// 校验配置并构造通道。
    pub fn build(self) -> Result<SecureChannel<T, E>, TlsError> {
        self.config.validate()?;
        let sizes = BufferSizes::resolve(self.engine.session_sizes(), &self.config);
        let tasks = self
            .tasks
            .unwrap_or_else(|| TaskPool::new(self.config.task_execution));
        let arena = self
            .arena
            .unwrap_or_else(|| Arc::new(SlabBufferPool::new()));
        Ok(SecureChannel {
            transport: self.transport,
            engine: Mutex::new(self.engine),
            arena,
            config: self.config,
            sizes,
            tasks,
            gate: AsyncMutex::new(HandshakeGate::Pending),
            handshaking: AtomicBool::new(true),
            on_handshake: Mutex::new(self.on_handshake),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            adaptive_write_size: AtomicUsize::new(UNBOUNDED_WRITE),
            close_signal: CloseSignal::new(),
            counters: Arc::new(Counters::default()),
        })
    }
}

impl<T, E> SecureChannel<T, E>
where
    T: Transport,
    E: TlsEngine,
    TlsError: From<T::Error>,
{
    /// 以底层通道与引擎开始构建。
    pub fn builder(transport: T, engine: E) -> SecureChannelBuilder<T, E> {
        SecureChannelBuilder {
            transport,
            engine,
            arena: None,
            config: SecureChannelConfig::default(),
            tasks: None,
            on_handshake: None,
        }
    }

    /// 读取明文。
    ///
    /// `timeout` 同时约束隐式握手：取它与配置中握手时限的较小者。
    /// 在途读被 [`SecureChannel::close`] 打断时返回 [`TlsError::Closed`]。
    pub async fn read(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<usize, TlsError> {
        self.ensure_open()?;
        self.ensure_handshake(timeout).await?;
        if dst.is_empty() {
            return Ok(0);
        }
        let timeout = timeout.or(self.config.read_timeout());
        let mut guard = self.reader.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(TlsError::Closed);
        };
        self.close_signal
            .guard(self.read_into(state, dst, timeout))
            .await
            .unwrap_or(Err(TlsError::Closed))
    }

    /// 写出明文，返回时全部密文已交给底层通道。
    ///
    /// 超时与关闭语义同 [`SecureChannel::read`]。
    pub async fn write(&self, src: &[u8], timeout: Option<Duration>) -> Result<usize, TlsError> {
        self.ensure_open()?;
        self.ensure_handshake(timeout).await?;
        let timeout = timeout.or(self.config.write_timeout());
        let mut guard = self.writer.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(TlsError::Closed);
        };
        self.close_signal
            .guard(self.write_from(state, src, timeout))
            .await
            .unwrap_or(Err(TlsError::Closed))
    }

    /// 幂等关闭。
    ///
    /// 在途的 `read`/`write` 先被唤醒并以 [`TlsError::Closed`] 结束，
    /// 随后本方法取回两半的会话缓冲，返回前三块缓冲均已归还。
    pub async fn close(&self) -> Result<(), TlsError> {
        if !self.close_signal.close() {
            return Ok(());
        }
        {
            let mut engine = self.engine.lock();
            if let Err(error) = engine.close_inbound() {
                debug!(channel = %self.transport.id(), %error, "inbound close rejected, peer may be gone");
            }
            engine.close_outbound();
        }

        let write_half = self.writer.lock().await.take();
        if let Some(mut state) = write_half {
            if self.config.send_close_notify
                && let Err(error) = self.flush_close_notify(&mut state).await
            {
                debug!(channel = %self.transport.id(), %error, "close_notify not delivered");
            }
            state.net_out.release();
        }
        let read_half = self.reader.lock().await.take();
        if let Some(state) = read_half {
            state.release();
        }

        self.transport.close().await?;
        debug!(channel = %self.transport.id(), "secure channel closed");
        Ok(())
    }

    /// 显式触发握手；`read`/`write` 会在首次调用时自动完成这一步。
    pub async fn handshake(&self) -> Result<(), TlsError> {
        self.ensure_open()?;
        self.ensure_handshake(None).await
    }

    /// 握手是否已成功完成。
    pub fn is_established(&self) -> bool {
        !self.handshaking.load(Ordering::Acquire)
    }

    /// 通道是否已被本端关闭。
    pub fn is_closed(&self) -> bool {
        self.close_signal.is_closed()
    }

    /// 底层通道。
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 在引擎锁内读取协商参数，例如 ALPN 或 SNI。
    pub fn with_engine<R>(&self, inspect: impl FnOnce(&E) -> R) -> R {
        inspect(&*self.engine.lock())
    }

    /// 运行统计快照。
    pub fn stats(&self) -> ChannelStats {
        let adaptive = self.adaptive_write_size.load(Ordering::Relaxed);
        ChannelStats {
            handshake_completions: self.counters.handshake_completions.load(Ordering::Relaxed),
            wrap_overflows: self.counters.wrap_overflows.load(Ordering::Relaxed),
            adaptive_write_size: (adaptive != UNBOUNDED_WRITE).then_some(adaptive),
            bytes_encrypted: self.counters.bytes_encrypted.load(Ordering::Relaxed),
            bytes_decrypted: self.counters.bytes_decrypted.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<(), TlsError> {
        if self.is_closed() {
            Err(TlsError::Closed)
        } else {
            Ok(())
        }
    }

    /// `requested` 是本次调用方给出的时限：等待闸门与驱动握手共用这一预算，
    /// 驱动阶段再与配置中的握手时限取较小者。
    async fn ensure_handshake(&self, requested: Option<Duration>) -> Result<(), TlsError> {
        if self.is_established() {
            return Ok(());
        }
        let started = Instant::now();
        let mut gate = match requested {
            Some(limit) => tokio::time::timeout(limit, self.gate.lock())
                .await
                .map_err(|_| TlsError::Timeout {
                    operation: HANDSHAKE_OPERATION,
                    after: limit,
                })?,
            None => self.gate.lock().await,
        };
        match &*gate {
            HandshakeGate::Established => return Ok(()),
            HandshakeGate::Failed(error) => return Err(error.clone()),
            HandshakeGate::Pending => {}
        }
        self.ensure_open()?;
        // 握手 Future 被取消时闸门保持失败态，引擎不会被二次驱动。
        *gate = HandshakeGate::Failed(TlsError::handshake(
            "handshake abandoned before completion",
        ));

        let span = debug_span!("tls_handshake", channel = %self.transport.id());
        let remaining = requested.map(|limit| limit.saturating_sub(started.elapsed()));
        let outcome = self
            .run_handshake(handshake_limit(remaining, self.config.handshake_timeout()))
            .instrument(span)
            .await;
        match outcome {
            Ok(buffers) => {
                self.install(buffers).await;
                *gate = HandshakeGate::Established;
                self.handshaking.store(false, Ordering::Release);
                Ok(())
            }
            Err(error) => {
                *gate = HandshakeGate::Failed(error.clone());
                Err(error)
            }
        }
    }

    async fn run_handshake(&self, timeout: Option<Duration>) -> Result<SessionBuffers, TlsError> {
        let model =
            HandshakeModel::allocate(&*self.arena, self.sizes, Some(self.completion_callback()))?;
        let options = HandshakeOptions {
            arena: &*self.arena,
            tasks: &self.tasks,
            growth: self.config.growth,
            sizes: self.sizes,
            timeout,
        };
        HandshakeDriver::new(&self.transport, &self.engine, model, options)
            .run()
            .await
    }

    fn completion_callback(&self) -> HandshakeCallback {
        let counters = Arc::clone(&self.counters);
        let user = self.on_handshake.lock().take();
        Box::new(move |outcome| {
            if outcome.is_ok() {
                counters.handshake_completions.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(user) = user {
                user(outcome);
            }
        })
    }

    async fn install(&self, buffers: SessionBuffers) {
        let SessionBuffers {
            net_in,
            net_out,
            app_in,
        } = buffers;
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            net_in.release();
            net_out.release();
            app_in.release();
            return;
        }
        *reader = Some(ReadHalf {
            net_in,
            app_in,
            empty_unwraps: 0,
        });
        *writer = Some(WriteHalf { net_out });
    }

    async fn read_into(
        &self,
        state: &mut ReadHalf,
        dst: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TlsError> {
        loop {
            if state.app_in.has_remaining() {
                return Ok(state.app_in.copy_to(dst));
            }

            let engine_buffered = self.engine.lock().has_buffered_plaintext();
            if state.net_in.has_remaining() || engine_buffered {
                match self.unwrap_pending(state)? {
                    Unwrapped::Plaintext | Unwrapped::Retry => continue,
                    Unwrapped::EndOfStream => return Ok(0),
                    Unwrapped::NeedInput => {}
                }
            }

            state.net_in.compact();
            if state.net_in.is_full() {
                grow(
                    &*self.arena,
                    &mut state.net_in,
                    self.config.growth,
                    self.sizes.net,
                    "net_in",
                )?;
            }
            let read = self
                .transport
                .read(state.net_in.spare_mut(), timeout)
                .await?;
            if read == 0 {
                debug!(channel = %self.transport.id(), "transport reached end of stream");
                return Ok(0);
            }
            state.net_in.commit(read);
        }
    }

    fn unwrap_pending(&self, state: &mut ReadHalf) -> Result<Unwrapped, TlsError> {
        let result = self
            .engine
            .lock()
            .unwrap(state.net_in.pending(), state.app_in.spare_mut())?;
        state.net_in.consume(result.bytes_consumed);
        state.app_in.commit(result.bytes_produced);
        trace!(
            consumed = result.bytes_consumed,
            produced = result.bytes_produced,
            status = ?result.status,
            "unwrap"
        );

        match result.status {
            EngineStatus::Ok if result.bytes_produced > 0 => {
                state.empty_unwraps = 0;
                self.counters
                    .bytes_decrypted
                    .fetch_add(result.bytes_produced as u64, Ordering::Relaxed);
                Ok(Unwrapped::Plaintext)
            }
            EngineStatus::Ok if result.bytes_consumed > 0 && state.net_in.has_remaining() => {
                state.empty_unwraps += 1;
                if state.empty_unwraps > self.config.max_empty_unwraps {
                    warn!(
                        channel = %self.transport.id(),
                        attempts = state.empty_unwraps,
                        "unwrap kept producing no plaintext, likely an engine bug"
                    );
                    state.empty_unwraps = 0;
                    Ok(Unwrapped::NeedInput)
                } else {
                    Ok(Unwrapped::Retry)
                }
            }
            EngineStatus::Ok | EngineStatus::BufferUnderflow => Ok(Unwrapped::NeedInput),
            EngineStatus::Closed => {
                debug!(channel = %self.transport.id(), "peer closed the tls session");
                Ok(Unwrapped::EndOfStream)
            }
            EngineStatus::BufferOverflow => {
                warn!(
                    channel = %self.transport.id(),
                    capacity = state.app_in.capacity(),
                    "unwrap overflowed the plaintext buffer"
                );
                grow(
                    &*self.arena,
                    &mut state.app_in,
                    self.config.growth,
                    self.sizes.app,
                    "app_in",
                )?;
                Ok(Unwrapped::Retry)
            }
        }
    }

    async fn write_from(
        &self,
        state: &mut WriteHalf,
        src: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TlsError> {
        self.flush(state, timeout).await?;
        let mut offset = 0;
        while offset < src.len() {
            let remaining = src.len() - offset;
            let mut attempt = remaining.min(self.adaptive_write_size.load(Ordering::Relaxed));
            loop {
                let chunk = &src[offset..offset + attempt];
                let result = self
                    .engine
                    .lock()
                    .wrap(chunk, state.net_out.spare_mut())?;
                state.net_out.commit(result.bytes_produced);
                match result.status {
                    EngineStatus::Ok => {
                        if result.bytes_consumed == 0 && result.bytes_produced == 0 {
                            return Err(TlsError::protocol(
                                "engine made no progress wrapping application data",
                            ));
                        }
                        offset += result.bytes_consumed;
                        self.counters
                            .bytes_encrypted
                            .fetch_add(result.bytes_consumed as u64, Ordering::Relaxed);
                        break;
                    }
                    EngineStatus::BufferOverflow => {
                        self.counters.wrap_overflows.fetch_add(1, Ordering::Relaxed);
                        if state.net_out.has_remaining() {
                            self.flush(state, timeout).await?;
                        } else if attempt > 1 {
                            attempt /= 2;
                            self.adaptive_write_size
                                .fetch_min(attempt, Ordering::Relaxed);
                            debug!(
                                channel = %self.transport.id(),
                                adaptive_write_size = attempt,
                                "narrowed adaptive write size"
                            );
                        } else {
                            grow(
                                &*self.arena,
                                &mut state.net_out,
                                self.config.growth,
                                self.sizes.net,
                                "net_out",
                            )?;
                        }
                    }
                    EngineStatus::Closed => return Err(TlsError::Closed),
                    EngineStatus::BufferUnderflow => {
                        return Err(TlsError::protocol("wrap reported buffer underflow"));
                    }
                }
            }
            self.flush(state, timeout).await?;
        }
        Ok(src.len())
    }

    async fn flush(&self, state: &mut WriteHalf, timeout: Option<Duration>) -> Result<(), TlsError> {
        while state.net_out.has_remaining() {
            let written = self
                .transport
                .write(state.net_out.pending(), timeout)
                .await?;
            if written == 0 {
                return Err(TlsError::protocol("transport accepted zero bytes"));
            }
            state.net_out.consume(written);
        }
        Ok(())
    }

    async fn flush_close_notify(&self, state: &mut WriteHalf) -> Result<(), TlsError> {
        let timeout = self.config.write_timeout();
        loop {
            let result = self.engine.lock().wrap(&[], state.net_out.spare_mut())?;
            state.net_out.commit(result.bytes_produced);
            self.flush(state, timeout).await?;
            if result.bytes_produced == 0 {
                return Ok(());
            }
        }
    }
}

/// 调用方时限与配置时限取较小者；任一方缺省时以另一方为准。
fn handshake_limit(requested: Option<Duration>, configured: Option<Duration>) -> Option<Duration> {
    match (requested, configured) {
        (Some(requested), Some(configured)) => Some(requested.min(configured)),
        (requested, configured) => requested.or(configured),
    }
}

impl<T, E> Drop for SecureChannel<T, E>
where
    T: Transport,
    E: TlsEngine,
{
    fn drop(&mut self) {
        if let Some(state) = self.reader.get_mut().take() {
            state.release();
        }
        if let Some(state) = self.writer.get_mut().take() {
            state.net_out.release();
        }
    }
}

impl<T, E> fmt::Debug for SecureChannel<T, E>
where
    T: Transport,
    E: TlsEngine,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("transport", &self.transport.id())
            .field("established", &!self.handshaking.load(Ordering::Acquire))
            .field("closed", &self.close_signal.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T, E> Transport for SecureChannel<T, E>
where
    T: Transport,
    E: TlsEngine,
    TlsError: From<T::Error>,
{
    type Error = TlsError;
    type ReadFuture<'a> = BoxFuture<'a, Result<usize, TlsError>>;
    type WriteFuture<'a> = BoxFuture<'a, Result<usize, TlsError>>;
    type CloseFuture<'a> = BoxFuture<'a, Result<(), TlsError>>;

    fn id(&self) -> Cow<'_, str> {
        Cow::Owned(format!("tls:{}", self.transport.id()))
    }

    fn read<'a>(&'a self, buf: &'a mut [u8], timeout: Option<Duration>) -> Self::ReadFuture<'a> {
        Box::pin(SecureChannel::read(self, buf, timeout))
    }

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> Self::WriteFuture<'a> {
        Box::pin(SecureChannel::write(self, buf, timeout))
    }

    fn close(&self) -> Self::CloseFuture<'_> {
        Box::pin(SecureChannel::close(self))
    }
}
