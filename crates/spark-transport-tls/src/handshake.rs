use std::{fmt, time::Duration};

use parking_lot::Mutex;
use spark_buffer::{BufferArena, PooledBuffer};
use spark_transport::Transport;
use tracing::{debug, trace, warn};

use crate::{
    config::BufferGrowth,
    engine::{EngineStatus, HandshakeStatus, TlsEngine},
    error::{HANDSHAKE_OPERATION, TlsError},
    session::{BufferSizes, SessionBuffers, grow},
    task::TaskPool,
};

/// 握手完成回调：成功时收到 `Ok(())`，失败时收到捕获的错误。
pub type HandshakeCallback = Box<dyn FnOnce(Result<(), TlsError>) + Send + 'static>;

/// 单次触发的回调槽。
///
/// 握手 Future 被中途丢弃（调用方取消）时，`Drop` 以失败结果补发回调，
/// 保证“恰好一次”在取消路径上同样成立。
struct CallbackSlot(Option<HandshakeCallback>);

impl CallbackSlot {
    fn fire(mut self, outcome: Result<(), TlsError>) {
        if let Some(callback) = self.0.take() {
            callback(outcome);
        }
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(TlsError::handshake(
                "handshake abandoned before completion",
            )));
        }
    }
}

/// 握手期间的瞬态状态：四块缓冲与单次回调。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手需要四块缓冲：明文出（握手阶段恒为空）、密文出、密文入、明文入（握手尾随的早到数据）；
///   其中后三块在握手成功后继续服务于稳态读写，不应归还后重新租借。
///
/// ## 逻辑（How）
/// - [`HandshakeModel::allocate`] 一次性租借四块缓冲；任一租借失败都会归还已租借的部分并以失败触发回调；
/// - [`HandshakeModel::complete`] 消耗模型：成功时先触发回调、再归还明文出缓冲，
///   其余三块以 [`SessionBuffers`] 的形式按值移交；失败时触发回调并归还全部四块。
///
/// ## 契约（What）
/// - 回调恰好触发一次，成功与失败互斥；
/// - `complete` 消耗 `self`，完成后的模型无法再被引用。
pub struct HandshakeModel {
    app_out: PooledBuffer,
    net_out: PooledBuffer,
    net_in: PooledBuffer,
    app_in: PooledBuffer,
    on_complete: CallbackSlot,
}

impl HandshakeModel {
    /// 从 `arena` 租借握手所需的四块缓冲。
    pub fn allocate(
        arena: &dyn BufferArena,
        sizes: BufferSizes,
        on_complete: Option<HandshakeCallback>,
    ) -> Result<Self, TlsError> {
        let on_complete = CallbackSlot(on_complete);
        let mut leased = Vec::with_capacity(4);
        for capacity in [sizes.app, sizes.net, sizes.net, sizes.app] {
            match arena.allocate(capacity) {
                Ok(buffer) => leased.push(buffer),
                Err(error) => return Err(abort(leased, error.into(), on_complete)),
            }
        }
        match <[PooledBuffer; 4]>::try_from(leased) {
            Ok([app_out, net_out, net_in, app_in]) => Ok(Self {
                app_out,
                net_out,
                net_in,
                app_in,
                on_complete,
            }),
            Err(leased) => Err(abort(
                leased,
                TlsError::protocol("incomplete handshake buffer set"),
                on_complete,
            )),
        }
    }

    /// 以握手结果结束模型。
    pub fn complete(self, outcome: Result<(), TlsError>) -> Result<SessionBuffers, TlsError> {
        let Self {
            app_out,
            net_out,
            net_in,
            app_in,
            on_complete,
        } = self;
        match outcome {
            Ok(()) => {
                on_complete.fire(Ok(()));
                app_out.release();
                Ok(SessionBuffers {
                    net_in,
                    net_out,
                    app_in,
                })
            }
            Err(error) => {
                on_complete.fire(Err(error.clone()));
                for buffer in [app_out, net_out, net_in, app_in] {
                    buffer.release();
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for HandshakeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeModel")
            .field("net_out", &self.net_out)
            .field("net_in", &self.net_in)
            .field("app_in", &self.app_in)
            .finish_non_exhaustive()
    }
}

fn abort(leased: Vec<PooledBuffer>, error: TlsError, on_complete: CallbackSlot) -> TlsError {
    for buffer in leased {
        buffer.release();
    }
    on_complete.fire(Err(error.clone()));
    error
}

/// 握手驱动的运行参数。
pub struct HandshakeOptions<'a> {
    pub arena: &'a dyn BufferArena,
    pub tasks: &'a TaskPool,
    pub growth: BufferGrowth,
    pub sizes: BufferSizes,
    pub timeout: Option<Duration>,
}

/// 握手驱动：把引擎从“刚创建”推进到“完成”或“失败”。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎只告诉我们“下一步需要什么”，真正的网络读写、任务执行与缓冲扩容都由驱动完成；
///   以 `async` 循环表达状态机后，每次 IO 完成即自然“重入”循环，无需手写回调链。
///
/// ## 逻辑（How）
/// - `NeedUnwrap`：密文入缓冲有待处理字节时先解密；没有进展（欠载）则压缩缓冲并发起一次网络读，
///   缓冲已满则按增长策略扩容；读到 EOF 立即失败；
/// - `NeedWrap`：密文出缓冲仍有残留先写出；否则以空明文调用 `wrap` 并写出产出的握手记录；
///   引擎报告 `Closed` 时尽力写出告警后失败；
/// - `NeedTask`：逐个取出委派任务交给 [`TaskPool`]，引擎锁不会跨越 `await`；
/// - `Finished` / `NotHandshaking`：写出残留字节后结束。
///
/// ## 契约（What）
/// - 整体受 `timeout` 约束，超时以 [`TlsError::Timeout`] 结束；
/// - 无论成功、失败或超时，模型的回调恰好触发一次（见 [`HandshakeModel::complete`]）。
pub struct HandshakeDriver<'a, T, E> {
    transport: &'a T,
    engine: &'a Mutex<E>,
    model: HandshakeModel,
    options: HandshakeOptions<'a>,
}

impl<'a, T, E> HandshakeDriver<'a, T, E>
where
    T: Transport,
    E: TlsEngine,
    TlsError: From<T::Error>,
{
    /// 组装驱动。
    pub fn new(
        transport: &'a T,
        engine: &'a Mutex<E>,
        model: HandshakeModel,
        options: HandshakeOptions<'a>,
    ) -> Self {
        Self {
            transport,
            engine,
            model,
            options,
        }
    }

    /// 执行握手，成功时返回移交给稳态读写的会话缓冲。
    pub async fn run(mut self) -> Result<SessionBuffers, TlsError> {
        let outcome = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.drive()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TlsError::Timeout {
                    operation: HANDSHAKE_OPERATION,
                    after: limit,
                }),
            },
            None => self.drive().await,
        };
        match &outcome {
            Ok(()) => debug!(channel = %self.transport.id(), "tls handshake finished"),
            Err(error) => debug!(
                channel = %self.transport.id(),
                code = error.code(),
                %error,
                "tls handshake failed"
            ),
        }
        self.model.complete(outcome)
    }

    async fn drive(&mut self) -> Result<(), TlsError> {
        self.engine.lock().begin_handshake()?;
        let mut previous = None;
        loop {
            let status = self.engine.lock().handshake_status();
            if previous != Some(status) {
                debug!(channel = %self.transport.id(), ?status, "handshake step");
                previous = Some(status);
            }
            match status {
                HandshakeStatus::NeedUnwrap => self.step_unwrap().await?,
                HandshakeStatus::NeedWrap => self.step_wrap().await?,
                HandshakeStatus::NeedTask => self.run_tasks().await?,
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.flush().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn step_unwrap(&mut self) -> Result<(), TlsError> {
        if self.model.net_in.has_remaining() {
            let model = &mut self.model;
            let result = self
                .engine
                .lock()
                .unwrap(model.net_in.pending(), model.app_in.spare_mut())?;
            model.net_in.consume(result.bytes_consumed);
            model.app_in.commit(result.bytes_produced);
            trace!(
                consumed = result.bytes_consumed,
                produced = result.bytes_produced,
                status = ?result.status,
                "handshake unwrap"
            );
            match result.status {
                EngineStatus::Ok if result.bytes_consumed > 0 || result.bytes_produced > 0 => {
                    return Ok(());
                }
                EngineStatus::Ok | EngineStatus::BufferUnderflow => {}
                EngineStatus::BufferOverflow => {
                    warn!(
                        channel = %self.transport.id(),
                        capacity = self.model.app_in.capacity(),
                        "unwrap overflowed the plaintext buffer during handshake"
                    );
                    return grow(
                        self.options.arena,
                        &mut self.model.app_in,
                        self.options.growth,
                        self.options.sizes.app,
                        "app_in",
                    );
                }
                EngineStatus::Closed => {
                    return Err(TlsError::handshake(
                        "peer closed the session during handshake",
                    ));
                }
            }
        }
        self.read_more().await
    }

    async fn read_more(&mut self) -> Result<(), TlsError> {
        self.model.net_in.compact();
        if self.model.net_in.is_full() {
            grow(
                self.options.arena,
                &mut self.model.net_in,
                self.options.growth,
                self.options.sizes.net,
                "net_in",
            )?;
        }
        let read = self
            .transport
            .read(self.model.net_in.spare_mut(), None)
            .await?;
        if read == 0 {
            return Err(TlsError::handshake(
                "peer closed the connection during handshake",
            ));
        }
        self.model.net_in.commit(read);
        Ok(())
    }

    async fn step_wrap(&mut self) -> Result<(), TlsError> {
        if self.model.net_out.has_remaining() {
            return self.flush().await;
        }
        let model = &mut self.model;
        let result = self
            .engine
            .lock()
            .wrap(model.app_out.pending(), model.net_out.spare_mut())?;
        model.app_out.consume(result.bytes_consumed);
        model.net_out.commit(result.bytes_produced);
        trace!(
            produced = result.bytes_produced,
            status = ?result.status,
            "handshake wrap"
        );
        match result.status {
            EngineStatus::Ok => {
                if result.bytes_produced == 0
                    && result.handshake_status == HandshakeStatus::NeedWrap
                {
                    return Err(TlsError::protocol(
                        "engine requested a wrap but produced no handshake data",
                    ));
                }
                self.flush().await
            }
            EngineStatus::BufferOverflow => grow(
                self.options.arena,
                &mut self.model.net_out,
                self.options.growth,
                self.options.sizes.net,
                "net_out",
            ),
            EngineStatus::Closed => {
                if let Err(error) = self.flush().await {
                    debug!(%error, "failed to deliver close alert during handshake");
                }
                Err(TlsError::handshake("engine closed during handshake"))
            }
            EngineStatus::BufferUnderflow => Err(TlsError::protocol(
                "wrap reported buffer underflow during handshake",
            )),
        }
    }

    async fn run_tasks(&mut self) -> Result<(), TlsError> {
        let mut executed = 0usize;
        loop {
            let task = self.engine.lock().delegated_task();
            let Some(task) = task else {
                break;
            };
            self.options.tasks.run(task).await?;
            executed += 1;
        }
        trace!(executed, "delegated tasks finished");
        if executed == 0 && self.engine.lock().handshake_status() == HandshakeStatus::NeedTask {
            return Err(TlsError::protocol(
                "engine requested a task but supplied none",
            ));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TlsError> {
        while self.model.net_out.has_remaining() {
            let written = self
                .transport
                .write(self.model.net_out.pending(), None)
                .await?;
            if written == 0 {
                return Err(TlsError::protocol("transport accepted zero bytes"));
            }
            self.model.net_out.consume(written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_buffer::{ArenaError, SlabBufferPool};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn recording_callback(
        outcomes: &Arc<parking_lot::Mutex<Vec<bool>>>,
    ) -> Option<HandshakeCallback> {
        let outcomes = Arc::clone(outcomes);
        Some(Box::new(move |outcome| outcomes.lock().push(outcome.is_ok())))
    }

    #[test]
    fn success_hands_over_three_buffers() {
        let pool = SlabBufferPool::new();
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let model = HandshakeModel::allocate(
            &pool,
            BufferSizes { net: 64, app: 32 },
            recording_callback(&outcomes),
        )
        .expect("租借握手缓冲失败");
        assert_eq!(pool.statistics().active_leases, 4);

        let session = model.complete(Ok(())).expect("握手应成功");
        assert_eq!(*outcomes.lock(), vec![true]);
        assert_eq!(pool.statistics().active_leases, 3);
        session.release();
        let stats = pool.statistics();
        assert_eq!(stats.releases, 4);
        assert_eq!(stats.implicit_releases, 0);
    }

    #[test]
    fn failure_releases_everything_and_reports_once() {
        let pool = SlabBufferPool::new();
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let model = HandshakeModel::allocate(
            &pool,
            BufferSizes { net: 64, app: 32 },
            recording_callback(&outcomes),
        )
        .expect("租借握手缓冲失败");
        let error = model
            .complete(Err(TlsError::handshake("boom")))
            .expect_err("应返回失败");
        assert_eq!(error.code(), "spark.transport.tls.handshake_failed");
        assert_eq!(*outcomes.lock(), vec![false]);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn allocation_failure_fires_callback() {
        let pool = SlabBufferPool::with_max_capacity(48);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let error = HandshakeModel::allocate(
            &pool,
            BufferSizes { net: 64, app: 32 },
            Some(Box::new(move |outcome| {
                assert!(outcome.is_err());
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .expect_err("超过池上限应失败");
        assert!(matches!(
            error,
            TlsError::Arena(ArenaError::CapacityLimit { .. })
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let stats = pool.statistics();
        assert_eq!(stats.active_leases, 0);
        assert_eq!(stats.implicit_releases, 0);
    }

    #[test]
    fn dropped_model_still_reports_failure() {
        let pool = SlabBufferPool::new();
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let model = HandshakeModel::allocate(
            &pool,
            BufferSizes { net: 16, app: 16 },
            recording_callback(&outcomes),
        )
        .expect("租借握手缓冲失败");
        drop(model);
        assert_eq!(*outcomes.lock(), vec![false]);
    }
}
