//! `round_trip` 属性测试：任意分块写入、任意尺寸读取，字节序列必须原样送达。
//!
//! 记录上限压得很小，迫使一次写入拆成多条记录、一次读取跨越多条记录，
//! 覆盖“部分交付 + 剩余明文留存”与“密文跨读拼接”两条路径。

mod support;

use std::sync::Arc;

use proptest::prelude::*;
use spark_buffer::{BufferArena, SlabBufferPool};
use spark_transport::MemoryChannel;
use spark_transport_tls::{SecureChannel, SecureChannelConfig, TaskExecution};
use support::ToyEngine;

const MAX_RECORD: usize = 32;

fn config() -> SecureChannelConfig {
    SecureChannelConfig {
        task_execution: TaskExecution::Inline,
        ..SecureChannelConfig::default()
    }
}

async fn exchange(chunks: Vec<Vec<u8>>, reads: Vec<usize>, pool: SlabBufferPool) -> Vec<u8> {
    let (left, right) = MemoryChannel::pair(4_096);
    let arena: Arc<dyn BufferArena> = Arc::new(pool);
    let client = SecureChannel::builder(left, ToyEngine::client().with_max_record(MAX_RECORD))
        .arena(Arc::clone(&arena))
        .config(config())
        .build()
        .expect("构造客户端失败");
    let server = SecureChannel::builder(right, ToyEngine::server().with_max_record(MAX_RECORD))
        .arena(arena)
        .config(config())
        .build()
        .expect("构造服务端失败");

    let expected: usize = chunks.iter().map(Vec::len).sum();
    let writer = tokio::spawn(async move {
        for chunk in &chunks {
            client.write(chunk, None).await.expect("写入失败");
        }
        client
    });

    let mut received = Vec::with_capacity(expected);
    let mut buf = [0u8; 64];
    let mut sizes = reads.iter().cycle();
    while received.len() < expected {
        let want = sizes.next().copied().unwrap_or(buf.len());
        let read = server.read(&mut buf[..want], None).await.expect("读取失败");
        assert!(read > 0, "数据未读完前不应出现 EOF");
        received.extend_from_slice(&buf[..read]);
    }

    let client = writer.await.expect("写入任务 panic");
    client.close().await.expect("客户端关闭失败");
    server.close().await.expect("服务端关闭失败");
    received
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn chunked_writes_arrive_intact(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..200), 1..12),
        reads in proptest::collection::vec(1usize..64, 1..16),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("构建运行时失败");
        let pool = SlabBufferPool::new();
        let expected = chunks.concat();
        let received = runtime.block_on(exchange(chunks, reads, pool.clone()));

        prop_assert_eq!(received, expected);
        let stats = pool.statistics();
        prop_assert_eq!(stats.active_leases, 0);
        prop_assert_eq!(stats.implicit_releases, 0);
    }
}
