//! 集成测试共享的测试替身。
//!
//! - [`ToyEngine`]：以“类型 + 长度 + 异或载荷”为记录格式的脚本化引擎，
//!   支持延迟的 `NeedTask`、单记录尺寸上限与若干探针；
//! - [`CountingTransport`]：统计网络读写次数的通道包装；
//! - `rustls_pair`：基于 `rcgen` 自签名证书构造一对 rustls 引擎。

#![allow(dead_code)]

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use spark_transport::Transport;
use spark_transport_tls::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, RustlsEngine, SessionSizes,
    TlsEngine, TlsError,
};

const HANDSHAKE: u8 = 0x16;
const DATA: u8 = 0x17;
const ALERT: u8 = 0x15;
const HEADER: usize = 3;
const MASK: u8 = 0x5A;
const HELLO: &[u8] = b"toy-hello";

/// 引擎探针：测试线程与引擎共享的观测点。
#[derive(Default)]
pub struct ToyProbe {
    pub data_wraps: AtomicUsize,
    pub overflows: AtomicUsize,
    pub tasks_run: AtomicUsize,
    /// 由测试的握手回调置位。
    pub callback_fired: AtomicBool,
    /// 在回调触发之前就收到应用数据 wrap 请求时置位。
    pub data_wrap_before_callback: AtomicBool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    SendHello,
    AwaitHello,
    Task { next: Next },
    Established,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Next {
    SendHello,
    Established,
}

/// 脚本化 TLS 引擎替身。
pub struct ToyEngine {
    phase: Phase,
    client: bool,
    task_delay: Option<Duration>,
    task_done: Arc<AtomicBool>,
    task_taken: bool,
    max_record: usize,
    outbound_closed: bool,
    alert_sent: bool,
    peer_closed: bool,
    probe: Arc<ToyProbe>,
}

impl ToyEngine {
    pub fn client() -> Self {
        Self::new(true)
    }

    pub fn server() -> Self {
        Self::new(false)
    }

    fn new(client: bool) -> Self {
        Self {
            phase: if client {
                Phase::SendHello
            } else {
                Phase::AwaitHello
            },
            client,
            task_delay: None,
            task_done: Arc::new(AtomicBool::new(false)),
            task_taken: false,
            max_record: 1_024,
            outbound_closed: false,
            alert_sent: false,
            peer_closed: false,
            probe: Arc::new(ToyProbe::default()),
        }
    }

    /// 收到对端 hello 后进入一次耗时 `delay` 的 `NeedTask`。
    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    /// 单条记录承载的最大明文。
    pub fn with_max_record(mut self, max_record: usize) -> Self {
        self.max_record = max_record;
        self
    }

    pub fn probe(&self) -> Arc<ToyProbe> {
        Arc::clone(&self.probe)
    }

    fn after_hello(&self) -> Next {
        if self.client {
            Next::Established
        } else {
            Next::SendHello
        }
    }

    fn advance(&mut self) {
        if let Phase::Task { next } = self.phase
            && self.task_done.load(Ordering::SeqCst)
        {
            self.phase = match next {
                Next::SendHello => Phase::SendHello,
                Next::Established => Phase::Established,
            };
        }
    }

    fn status_of(phase: Phase, task_done: bool) -> HandshakeStatus {
        match phase {
            Phase::SendHello => HandshakeStatus::NeedWrap,
            Phase::AwaitHello => HandshakeStatus::NeedUnwrap,
            Phase::Task { next } if task_done => match next {
                Next::SendHello => HandshakeStatus::NeedWrap,
                Next::Established => HandshakeStatus::NotHandshaking,
            },
            Phase::Task { .. } => HandshakeStatus::NeedTask,
            Phase::Established => HandshakeStatus::NotHandshaking,
        }
    }

    fn current_status(&self) -> HandshakeStatus {
        Self::status_of(self.phase, self.task_done.load(Ordering::SeqCst))
    }
}

fn seal(kind: u8, payload: &[u8], dst: &mut [u8]) -> usize {
    let len = payload.len() as u16;
    dst[0] = kind;
    dst[1..HEADER].copy_from_slice(&len.to_be_bytes());
    for (out, byte) in dst[HEADER..HEADER + payload.len()].iter_mut().zip(payload) {
        *out = byte ^ MASK;
    }
    HEADER + payload.len()
}

/// 以记录格式封装明文，供测试直接构造密文。
pub fn toy_record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER + payload.len()];
    seal(kind, payload, &mut out);
    out
}

pub const TOY_DATA: u8 = DATA;
pub const TOY_HANDSHAKE: u8 = HANDSHAKE;

impl TlsEngine for ToyEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        self.advance();
        if self.outbound_closed {
            let mut produced = 0;
            if !self.alert_sent && dst.len() >= HEADER {
                produced = seal(ALERT, &[], dst);
                self.alert_sent = true;
            }
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                self.current_status(),
                0,
                produced,
            ));
        }
        match self.phase {
            Phase::SendHello => {
                if dst.len() < HEADER + HELLO.len() {
                    return Ok(EngineResult::new(
                        EngineStatus::BufferOverflow,
                        HandshakeStatus::NeedWrap,
                        0,
                        0,
                    ));
                }
                let produced = seal(HANDSHAKE, HELLO, dst);
                let finished = !self.client;
                self.phase = if finished {
                    Phase::Established
                } else {
                    Phase::AwaitHello
                };
                let status = if finished {
                    HandshakeStatus::Finished
                } else {
                    HandshakeStatus::NeedUnwrap
                };
                Ok(EngineResult::new(EngineStatus::Ok, status, 0, produced))
            }
            Phase::Established if !src.is_empty() => {
                self.probe.data_wraps.fetch_add(1, Ordering::SeqCst);
                if !self.probe.callback_fired.load(Ordering::SeqCst) {
                    self.probe
                        .data_wrap_before_callback
                        .store(true, Ordering::SeqCst);
                }
                let take = src.len().min(self.max_record);
                if dst.len() < HEADER + take {
                    self.probe.overflows.fetch_add(1, Ordering::SeqCst);
                    return Ok(EngineResult::new(
                        EngineStatus::BufferOverflow,
                        HandshakeStatus::NotHandshaking,
                        0,
                        0,
                    ));
                }
                let produced = seal(DATA, &src[..take], dst);
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::NotHandshaking,
                    take,
                    produced,
                ))
            }
            _ => {
                if !src.is_empty() {
                    self.probe
                        .data_wrap_before_callback
                        .store(true, Ordering::SeqCst);
                }
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    self.current_status(),
                    0,
                    0,
                ))
            }
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        self.advance();
        let underflow = EngineResult::new(
            EngineStatus::BufferUnderflow,
            self.current_status(),
            0,
            0,
        );
        if self.peer_closed {
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                self.current_status(),
                0,
                0,
            ));
        }
        if src.len() < HEADER {
            return Ok(underflow);
        }
        let kind = src[0];
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER + len {
            return Ok(underflow);
        }
        let payload = &src[HEADER..HEADER + len];
        let consumed = HEADER + len;
        match kind {
            HANDSHAKE if self.phase == Phase::AwaitHello => {
                let next = self.after_hello();
                self.phase = match (self.task_delay, next) {
                    (Some(_), next) => Phase::Task { next },
                    (None, Next::SendHello) => Phase::SendHello,
                    (None, Next::Established) => Phase::Established,
                };
                let status = if self.phase == Phase::Established {
                    HandshakeStatus::Finished
                } else {
                    self.current_status()
                };
                Ok(EngineResult::new(EngineStatus::Ok, status, consumed, 0))
            }
            DATA if self.phase == Phase::Established => {
                if dst.len() < len {
                    return Ok(EngineResult::new(
                        EngineStatus::BufferOverflow,
                        HandshakeStatus::NotHandshaking,
                        0,
                        0,
                    ));
                }
                for (out, byte) in dst[..len].iter_mut().zip(payload) {
                    *out = byte ^ MASK;
                }
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::NotHandshaking,
                    consumed,
                    len,
                ))
            }
            ALERT => {
                self.peer_closed = true;
                Ok(EngineResult::new(
                    EngineStatus::Closed,
                    self.current_status(),
                    consumed,
                    0,
                ))
            }
            _ => Err(TlsError::protocol("unexpected toy record")),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.current_status()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        let (Phase::Task { .. }, Some(delay)) = (self.phase, self.task_delay) else {
            return None;
        };
        if self.task_taken {
            return None;
        }
        self.task_taken = true;
        let done = Arc::clone(&self.task_done);
        let probe = Arc::clone(&self.probe);
        Some(Box::new(move || {
            thread::sleep(delay);
            probe.tasks_run.fetch_add(1, Ordering::SeqCst);
            done.store(true, Ordering::SeqCst);
        }))
    }

    fn close_inbound(&mut self) -> Result<(), TlsError> {
        if self.peer_closed {
            Ok(())
        } else {
            Err(TlsError::protocol("toy peer did not send an alert"))
        }
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn session_sizes(&self) -> SessionSizes {
        SessionSizes {
            application: self.max_record,
            packet: self.max_record + HEADER,
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 网络读写计数。
#[derive(Default)]
pub struct IoCounts {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl IoCounts {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

/// 统计读写次数的通道包装。
pub struct CountingTransport<T> {
    inner: T,
    counts: Arc<IoCounts>,
}

impl<T> CountingTransport<T> {
    pub fn new(inner: T) -> (Self, Arc<IoCounts>) {
        let counts = Arc::new(IoCounts::default());
        (
            Self {
                inner,
                counts: Arc::clone(&counts),
            },
            counts,
        )
    }
}

impl<T: Transport> Transport for CountingTransport<T> {
    type Error = T::Error;
    type ReadFuture<'a> = BoxFuture<'a, Result<usize, T::Error>>;
    type WriteFuture<'a> = BoxFuture<'a, Result<usize, T::Error>>;
    type CloseFuture<'a> = BoxFuture<'a, Result<(), T::Error>>;

    fn id(&self) -> Cow<'_, str> {
        self.inner.id()
    }

    fn read<'a>(&'a self, buf: &'a mut [u8], timeout: Option<Duration>) -> Self::ReadFuture<'a> {
        self.counts.reads.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.inner.read(buf, timeout))
    }

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> Self::WriteFuture<'a> {
        self.counts.writes.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.inner.write(buf, timeout))
    }

    fn close(&self) -> Self::CloseFuture<'_> {
        Box::pin(self.inner.close())
    }
}

/// 生成自签名证书并构造一对 rustls 引擎（客户端, 服务端）。
pub fn rustls_pair(host: &str) -> Result<(RustlsEngine, RustlsEngine)> {
    use rcgen::{CertifiedKey, generate_simple_self_signed};
    use rustls::{
        ClientConfig, RootCertStore, ServerConfig,
        crypto::ring,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
    };

    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec![host.to_string()]).context("生成自签名证书失败")?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(ring::default_provider());
    let server_config = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .context("选择协议版本失败")?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .context("构建服务端 TLS 配置失败")?;

    let mut roots = RootCertStore::empty();
    roots
        .add(cert_der)
        .context("将自签名证书加入 RootCertStore 失败")?;
    let client_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("选择协议版本失败")?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string()).context("非法的服务器名称")?;
    let client = RustlsEngine::client(Arc::new(client_config), server_name)
        .context("创建客户端引擎失败")?;
    let server = RustlsEngine::server(Arc::new(server_config)).context("创建服务端引擎失败")?;
    Ok((client, server))
}
