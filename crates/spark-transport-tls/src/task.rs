use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::{config::TaskExecution, engine::DelegatedTask, error::TlsError};

/// 委派任务执行器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎的委派任务（密钥派生、证书链校验）可能耗时不定，直接在驱动握手的异步任务上执行
///   会占住共享的 IO 工作线程；投递到阻塞线程池后，握手在任务完成时自然恢复。
///
/// ## 逻辑（How）
/// - `Blocking` 模式下先取得信号量许可，再 `spawn_blocking`，许可随任务结束释放；
/// - 任务 panic 时 `JoinError` 被映射为 [`TlsError::Task`]，握手随之失败。
///
/// ## 契约（What）
/// - 执行器可在多条连接之间共享（`Clone` 只复制信号量句柄）；
/// - `Blocking` 模式要求在 Tokio 运行时中调用。
#[derive(Clone, Debug)]
pub struct TaskPool {
    permits: Option<Arc<Semaphore>>,
}

impl TaskPool {
    /// 按配置构造执行器。
    pub fn new(execution: TaskExecution) -> Self {
        let permits = match execution {
            TaskExecution::Inline => None,
            TaskExecution::Blocking { max_concurrent } => {
                Some(Arc::new(Semaphore::new(max_concurrent.max(1))))
            }
        };
        Self { permits }
    }

    /// 执行一个委派任务，直至其完成。
    pub async fn run(&self, task: DelegatedTask) -> Result<(), TlsError> {
        let Some(permits) = &self.permits else {
            task();
            return Ok(());
        };
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|_| TlsError::Task("task pool shut down".into()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task();
        })
        .await
        .map_err(|error| TlsError::Task(error.to_string().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn inline_and_blocking_tasks_both_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        for execution in [
            TaskExecution::Inline,
            TaskExecution::Blocking { max_concurrent: 1 },
        ] {
            let pool = TaskPool::new(execution);
            let counter = Arc::clone(&counter);
            pool.run(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .expect("任务应执行成功");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let pool = TaskPool::new(TaskExecution::Blocking { max_concurrent: 2 });
        let error = pool
            .run(Box::new(|| panic!("key schedule exploded")))
            .await
            .expect_err("panic 应转为错误");
        assert_eq!(error.code(), "spark.transport.tls.task_failed");
    }
}
