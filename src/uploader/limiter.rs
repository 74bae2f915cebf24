// 有界并发调度
//
// - Semaphore 控制同时执行的单元数
// - JoinSet 管理并发任务
// - 单元失败（错误或 panic）只记录在自己的结果中，不影响其他单元
// - 所有单元结束后才返回
// - 调用方丢弃 run_bounded 的 future 时，尚未结束的单元一并中止

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, info};

/// 离开作用域时中止对应任务（任务已结束时无影响）
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 在独立任务中执行 future，panic 以 JoinError 返回
///
/// 返回的 future 被丢弃时，独立任务也会被中止
pub(crate) async fn run_isolated<T, Fut>(fut: Fut) -> Result<T, JoinError>
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    let _guard = AbortOnDrop(handle.abort_handle());
    (&mut handle).await
}

/// 单元执行结果
#[derive(Debug)]
pub enum UnitOutcome<T, E> {
    Completed(T),
    Failed(E),
    /// 单元执行过程中 panic
    Panicked(String),
}

impl<T, E> UnitOutcome<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, UnitOutcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            UnitOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }
}

/// 有界并发执行器
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    /// 当前正在执行的单元数
    active: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// 创建执行器（max_concurrent 为 0 时按 1 处理）
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前正在执行的单元数
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 执行所有单元，同一时刻最多 max_concurrent 个
    ///
    /// 结果按单元输入顺序返回；空输入立即返回，不调用 worker。
    /// 返回的 future 被丢弃时，正在执行的单元会被中止
    pub async fn run_bounded<U, T, E, F, Fut>(&self, units: Vec<U>, worker: F) -> Vec<UnitOutcome<T, E>>
    where
        U: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(U) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let total = units.len();
        if total == 0 {
            return Vec::new();
        }

        debug!(
            "[并发调度] 开始执行 {} 个单元，最大并发数: {}",
            total, self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let worker = Arc::new(worker);
        let mut join_set: JoinSet<(usize, Result<Result<T, E>, JoinError>)> = JoinSet::new();
        let mut results: Vec<Option<UnitOutcome<T, E>>> = (0..total).map(|_| None).collect();

        for (index, unit) in units.into_iter().enumerate() {
            // 等待空闲槽位
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    error!("[并发调度] 获取许可失败: {}", e);
                    break;
                }
            };

            let worker = worker.clone();
            let active = self.active.clone();
            active.fetch_add(1, Ordering::SeqCst);

            join_set.spawn(async move {
                let outcome = run_isolated(worker(unit)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                (index, outcome)
            });

            // 非阻塞收集已完成的单元
            while let Some(done) = join_set.try_join_next() {
                record(&mut results, done);
            }
        }

        // 等待所有剩余单元完成
        while let Some(done) = join_set.join_next().await {
            record(&mut results, done);
        }

        let outcomes: Vec<UnitOutcome<T, E>> = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| UnitOutcome::Panicked("单元未执行".to_string())))
            .collect();

        let completed = outcomes.iter().filter(|o| o.is_completed()).count();
        info!(
            "[并发调度] 全部 {} 个单元已结束: 成功 {}, 失败 {}",
            total,
            completed,
            total - completed
        );

        outcomes
    }
}

fn record<T, E>(
    results: &mut [Option<UnitOutcome<T, E>>],
    done: Result<(usize, Result<Result<T, E>, JoinError>), JoinError>,
) {
    match done {
        Ok((index, Ok(Ok(value)))) => results[index] = Some(UnitOutcome::Completed(value)),
        Ok((index, Ok(Err(e)))) => results[index] = Some(UnitOutcome::Failed(e)),
        Ok((index, Err(join_err))) => {
            error!("[并发调度] 单元 #{} 异常: {}", index, join_err);
            results[index] = Some(UnitOutcome::Panicked(join_err.to_string()));
        }
        Err(join_err) => {
            error!("[并发调度] 调度任务异常: {}", join_err);
        }
    }
}

/// 便捷函数：以 max_concurrent 的并发上限执行所有单元
pub async fn run_bounded<U, T, E, F, Fut>(
    units: Vec<U>,
    max_concurrent: usize,
    worker: F,
) -> Vec<UnitOutcome<T, E>>
where
    U: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(U) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    ConcurrencyLimiter::new(max_concurrent)
        .run_bounded(units, worker)
        .await
}
