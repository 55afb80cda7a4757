use std::{
    borrow::Cow,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};
use tracing::debug;

use crate::{
    channel::Transport,
    error::{CLOSE, CONNECT, Operation, READ, TransportError, WRITE},
    util::{CloseSignal, with_timeout},
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 基于 Tokio 读写半连接的通道实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TCP 套接字与内存管道在 Tokio 中都能拆成 `AsyncRead` + `AsyncWrite` 两半；
///   以泛型承载后，两者共享同一份超时、关闭与错误映射逻辑。
///
/// ## 逻辑（How）
/// - 读半、写半各自由 `tokio::sync::Mutex` 包裹，满足“单读 + 单写可并行”的约束；
/// - 每次 IO 都在 [`CloseSignal`] 之下运行：关闭后开始的操作直接返回 `TransportError::Closed`，
///   关闭前已在等待的读写被唤醒并以同样的错误结束；
/// - `close` 随后关闭写方向（发送 FIN / 结束管道）。
///
/// ## 契约（What）
/// - 见 [`Transport`]；`write` 单次只写出一个前缀，与底层 `poll_write` 语义一致。
///
/// ## 风险与权衡（Trade-offs）
/// - 被关闭打断的读写不会留下部分结果：Tokio 的读写 Future 只在完成时推进游标。
pub struct StreamChannel<R, W> {
    id: String,
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    close_signal: CloseSignal,
}

/// TCP 通道。
pub type TcpChannel = StreamChannel<OwnedReadHalf, OwnedWriteHalf>;

/// 进程内双工管道通道，常用于测试与同进程组件间的回环。
pub type MemoryChannel = StreamChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

impl<R, W> StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// 由读写两半构造通道。
    pub fn new(id: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            id: id.into(),
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            close_signal: CloseSignal::new(),
        }
    }

    /// 通道是否已被本端关闭。
    pub fn is_closed(&self) -> bool {
        self.close_signal.is_closed()
    }

    fn ensure_open(&self, operation: Operation) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed { operation })
        } else {
            Ok(())
        }
    }

    async fn read_some(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        self.ensure_open(READ)?;
        let read = with_timeout(READ, timeout, async {
            let mut reader = self.reader.lock().await;
            reader.read(buf).await
        });
        self.close_signal
            .guard(read)
            .await
            .unwrap_or(Err(TransportError::Closed { operation: READ }))
    }

    async fn write_some(
        &self,
        buf: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        self.ensure_open(WRITE)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let write = with_timeout(WRITE, timeout, async {
            let mut writer = self.writer.lock().await;
            match writer.write(buf).await? {
                0 => Err(io::Error::from(io::ErrorKind::WriteZero)),
                written => Ok(written),
            }
        });
        self.close_signal
            .guard(write)
            .await
            .unwrap_or(Err(TransportError::Closed { operation: WRITE }))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if !self.close_signal.close() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
                ) =>
            {
                debug!(channel = %self.id, %error, "peer already gone while closing");
                Ok(())
            }
            Err(error) => Err(TransportError::io(CLOSE, error)),
        }
    }
}

impl StreamChannel<OwnedReadHalf, OwnedWriteHalf> {
    /// 建立到 `addr` 的 TCP 连接。
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|error| TransportError::io(CONNECT, error))?;
        Self::from_stream(stream)
    }

    /// 包装已建立的 `TcpStream`。
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let local = stream
            .local_addr()
            .map_err(|error| TransportError::io(CONNECT, error))?;
        let peer = stream
            .peer_addr()
            .map_err(|error| TransportError::io(CONNECT, error))?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(format!("tcp:{local}->{peer}"), reader, writer))
    }
}

impl StreamChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>> {
    /// 创建一对互联的内存通道，`max_buf_size` 为每个方向的管道容量。
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(max_buf_size);
        let (left_reader, left_writer) = tokio::io::split(left);
        let (right_reader, right_writer) = tokio::io::split(right);
        (
            Self::new("memory:left", left_reader, left_writer),
            Self::new("memory:right", right_reader, right_writer),
        )
    }
}

impl<R, W> Transport for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Error = TransportError;
    type ReadFuture<'a> = BoxFuture<'a, Result<usize, TransportError>>;
    type WriteFuture<'a> = BoxFuture<'a, Result<usize, TransportError>>;
    type CloseFuture<'a> = BoxFuture<'a, Result<(), TransportError>>;

    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }

    fn read<'a>(&'a self, buf: &'a mut [u8], timeout: Option<Duration>) -> Self::ReadFuture<'a> {
        Box::pin(self.read_some(buf, timeout))
    }

    fn write<'a>(&'a self, buf: &'a [u8], timeout: Option<Duration>) -> Self::WriteFuture<'a> {
        Box::pin(self.write_some(buf, timeout))
    }

    fn close(&self) -> Self::CloseFuture<'_> {
        Box::pin(self.shutdown())
    }
}
