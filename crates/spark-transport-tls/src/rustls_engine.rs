use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{
    AlertDescription, ClientConfig, ClientConnection, Connection, Error as RustlsError,
    ServerConfig, ServerConnection, pki_types::ServerName,
};
use tracing::trace;

use crate::{
    engine::{
        DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, SessionSizes, TlsEngine,
    },
    error::{EngineFailure, TlsError},
};

/// 单条记录可承载的最大明文。
const MAX_FRAGMENT_LEN: usize = 16_384;
/// 单条记录加密后的上限：5 字节头部 + 明文 + 2048 字节扩展余量（TLS 1.2 兼容值）。
const MAX_RECORD_LEN: usize = 16_709;
/// 每条记录的封装开销估算：头部、内容类型、认证标签与显式 nonce。
const RECORD_OVERHEAD: usize = 64;

/// 以 `rustls` 为后端的 [`TlsEngine`] 实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls` 本身是无 IO 的状态机（`read_tls`/`process_new_packets`/`write_tls`），
///   与“wrap/unwrap + 握手诉求”的引擎契约天然契合，只需在两者之间做状态翻译。
///
/// ## 逻辑（How）
/// - `wrap`：握手期间或 `src` 为空时仅把已排队的握手/告警记录写入 `dst`；
///   会话建立后先估算密文尺寸（明文 + 每条记录开销 + 已排队字节），放不下则报告
///   `BufferOverflow` 且不消费任何明文，否则写入 `writer()` 并立即输出密文；
/// - `unwrap`：若引擎内已无待读明文才调用 `read_tls` 摄入密文，随后
///   `process_new_packets` 并把明文从 `reader()` 取入 `dst`；
/// - 握手诉求由 `is_handshaking()` 与 `wants_write()` 推导，最后一批握手记录
///   （客户端 Finished、服务端会话票据）以 `NeedWrap` 报告，写出后才报告一次 `Finished`。
///
/// ## 契约（What）
/// - `rustls` 没有委派任务，`delegated_task` 恒为 `None`；
/// - `close_inbound` 在未收到 `close_notify` 时返回错误，调用方应容忍；
/// - 错误按证书、告警、完整性等维度映射为 [`EngineFailure`]。
///
/// ## 风险与权衡（Trade-offs）
/// - 密文尺寸为保守估算，目标缓冲接近估算值时会提前报告溢出，由调用方的自适应写尺寸吸收。
pub struct RustlsEngine {
    conn: Connection,
    handshake_complete: bool,
    outbound_closed: bool,
    peer_closed: bool,
}

impl RustlsEngine {
    /// 创建客户端引擎。
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TlsError> {
        let conn = ClientConnection::new(config, server_name).map_err(map_rustls_error)?;
        Ok(Self::from_connection(conn.into()))
    }

    /// 创建服务端引擎。
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(map_rustls_error)?;
        Ok(Self::from_connection(conn.into()))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            handshake_complete: false,
            outbound_closed: false,
            peer_closed: false,
        }
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// 客户端在 ClientHello 中携带的 SNI，仅服务端可见。
    pub fn server_name(&self) -> Option<&str> {
        match &self.conn {
            Connection::Server(server) => server.server_name(),
            Connection::Client(_) => None,
        }
    }

    /// 访问底层连接，用于读取协商参数。
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn queued_ciphertext(&mut self) -> Result<usize, TlsError> {
        let state = self.conn.process_new_packets().map_err(map_rustls_error)?;
        Ok(state.tls_bytes_to_write())
    }

    fn retained_plaintext(&mut self) -> Result<usize, TlsError> {
        let state = self.conn.process_new_packets().map_err(map_rustls_error)?;
        Ok(state.plaintext_bytes_to_read())
    }

    fn flush_into(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let total = dst.len();
        let mut out: &mut [u8] = dst;
        while self.conn.wants_write() && !out.is_empty() {
            let written = self.conn.write_tls(&mut out).map_err(map_io_error)?;
            if written == 0 {
                break;
            }
        }
        Ok(total - out.len())
    }

    fn drain_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let mut produced = 0;
        while produced < dst.len() {
            match self.conn.reader().read(&mut dst[produced..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(read) => produced += read,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    self.peer_closed = true;
                    break;
                }
                Err(error) => return Err(map_io_error(error)),
            }
        }
        Ok(produced)
    }

    fn settle(&mut self) -> HandshakeStatus {
        let status = self.peek_status();
        if status == HandshakeStatus::Finished {
            self.handshake_complete = true;
        }
        status
    }

    fn peek_status(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if self.handshake_complete {
            HandshakeStatus::NotHandshaking
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::Finished
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        // rustls 在构造连接时已进入握手，客户端的 ClientHello 已排队等待写出。
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        if self.outbound_closed {
            let produced = self.flush_into(dst)?;
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                self.settle(),
                0,
                produced,
            ));
        }

        let mut consumed = 0;
        if !src.is_empty() && !self.conn.is_handshaking() {
            let queued = self.queued_ciphertext()?;
            if queued + sealed_len(src.len()) > dst.len() {
                return Ok(EngineResult::new(
                    EngineStatus::BufferOverflow,
                    self.peek_status(),
                    0,
                    0,
                ));
            }
            consumed = self.conn.writer().write(src).map_err(map_io_error)?;
        }

        if self.conn.wants_write() && dst.is_empty() {
            return Ok(EngineResult::new(
                EngineStatus::BufferOverflow,
                self.peek_status(),
                consumed,
                0,
            ));
        }
        let produced = self.flush_into(dst)?;
        trace!(consumed, produced, "rustls wrap");
        Ok(EngineResult::new(
            EngineStatus::Ok,
            self.settle(),
            consumed,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let retained = self.retained_plaintext()?;
        if dst.is_empty() && (retained > 0 || !self.conn.is_handshaking()) {
            return Ok(EngineResult::new(
                EngineStatus::BufferOverflow,
                self.peek_status(),
                0,
                0,
            ));
        }

        let mut consumed = 0;
        if retained == 0 && !src.is_empty() && !self.peer_closed {
            let mut input: &[u8] = src;
            consumed = self.conn.read_tls(&mut input).map_err(map_io_error)?;
            let state = self.conn.process_new_packets().map_err(map_rustls_error)?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }

        let produced = self.drain_plaintext(dst)?;
        let handshake_status = self.settle();
        let status = if produced == 0 && self.peer_closed {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        trace!(consumed, produced, ?status, "rustls unwrap");
        Ok(EngineResult::new(status, handshake_status, consumed, produced))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.peek_status()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_inbound(&mut self) -> Result<(), TlsError> {
        if self.peer_closed {
            Ok(())
        } else {
            Err(TlsError::protocol(
                "inbound closed without receiving close_notify",
            ))
        }
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn session_sizes(&self) -> SessionSizes {
        SessionSizes {
            application: MAX_FRAGMENT_LEN,
            packet: MAX_RECORD_LEN,
        }
    }

    fn has_buffered_plaintext(&mut self) -> bool {
        match self.retained_plaintext() {
            Ok(retained) => retained > 0,
            Err(error) => {
                // rustls 的错误是粘滞的：返回 true 让读路径走到 unwrap，由它报告同一错误。
                trace!(%error, "rustls rejected buffered records while checking for plaintext");
                true
            }
        }
    }
}

fn sealed_len(plaintext: usize) -> usize {
    let records = plaintext.div_ceil(MAX_FRAGMENT_LEN).max(1);
    plaintext + records * RECORD_OVERHEAD
}

fn map_io_error(error: io::Error) -> TlsError {
    let class = match error.kind() {
        io::ErrorKind::InvalidData => EngineFailure::Integrity,
        io::ErrorKind::OutOfMemory | io::ErrorKind::WriteZero => EngineFailure::Resource,
        _ => EngineFailure::Other,
    };
    TlsError::engine(class, error)
}

/// 将 rustls 错误映射为引擎失败类别。
pub(crate) fn map_rustls_error(error: RustlsError) -> TlsError {
    let class = classify_rustls_error(&error);
    TlsError::engine(class, error)
}

fn classify_rustls_error(error: &RustlsError) -> EngineFailure {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => EngineFailure::Integrity,
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => EngineFailure::Authentication,
        FailedToGetCurrentTime | FailedToGetRandomBytes | BadMaxFragmentSize => {
            EngineFailure::Resource
        }
        AlertReceived(alert) => classify_alert(alert),
        _ => EngineFailure::Other,
    }
}

fn classify_alert(alert: &AlertDescription) -> EngineFailure {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired => EngineFailure::Authentication,
        AccessDenied => EngineFailure::Authorization,
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | ProtocolVersion => EngineFailure::Integrity,
        DecompressionFailure => EngineFailure::Resource,
        _ => EngineFailure::Other,
    }
}
