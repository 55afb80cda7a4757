#![deny(unsafe_code)]
#![doc = "spark-transport: 异步字节通道能力契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：TLS 记录引擎只关心 `read`/`write`/`close` 三种能力，不应绑定某种具体传输；以 trait 表达后，TCP、内存管道乃至另一层安全通道都可以互相替换。"]
#![doc = "- **What**：定义 [`Transport`] 契约与 [`TransportError`]，并提供基于 Tokio `AsyncRead`/`AsyncWrite` 半连接的 [`StreamChannel`]（[`TcpChannel`]、[`MemoryChannel`]）。"]
#![doc = "- **How**：读写各自持有一把异步互斥锁，保证“单个在途读 + 单个在途写”可以并行；超时通过 [`with_timeout`] 统一注入，关闭通过 [`CloseSignal`] 唤醒在途操作。"]

mod channel;
mod error;
mod stream;
mod util;

pub use channel::Transport;
pub use error::{CLOSE, CONNECT, Operation, READ, TransportError, WRITE};
pub use stream::{MemoryChannel, StreamChannel, TcpChannel};
pub use util::{CloseSignal, with_timeout};
