// 分片上传协调器
//
// 两种模式：
// 1. 单文件模式：每个分片一个任务，分片之间互不影响（一个分片失败不阻止其他分片）
// 2. 批量模式：所有文件的分片放入同一个全局并发池；
//    某个文件的任一分片失败后，该文件不再派发新的分片，其他文件不受影响
//
// 取消只在分片派发前检查，已经发出的请求不会被中断

use crate::error::{AttemptError, Result, UploadError};
use crate::uploader::chunk::{build_descriptors, expected_chunk_count, ChunkDescriptor};
use crate::uploader::executor::{notify, AttemptObserver, RetryPolicy, RetryableRequestExecutor};
use crate::uploader::limiter::{run_isolated, ConcurrencyLimiter, UnitOutcome};
use crate::uploader::payload::PayloadSource;
use crate::uploader::transport::{HeaderProvider, HttpMethod, HttpRequest};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 数据结构
// =====================================================

/// 单个文件的上传描述
#[derive(Clone)]
pub struct FileUploadSpec {
    /// 上传数据
    pub payload: Arc<dyn PayloadSource>,
    /// Content-Type
    pub mime_type: String,
    /// 分片大小
    pub block_size: u64,
    /// 每个分片的目标 URL（按分片顺序）
    pub destination_urls: Vec<String>,
}

impl FileUploadSpec {
    pub fn new(
        payload: Arc<dyn PayloadSource>,
        mime_type: impl Into<String>,
        block_size: u64,
        destination_urls: Vec<String>,
    ) -> Self {
        Self {
            payload,
            mime_type: mime_type.into(),
            block_size,
            destination_urls,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.payload.total_size()
    }

    pub fn expected_chunk_count(&self) -> usize {
        expected_chunk_count(self.total_size(), self.block_size)
    }

    /// 校验并生成分片描述
    pub fn descriptors(&self) -> Result<Vec<ChunkDescriptor>> {
        build_descriptors(self.total_size(), self.block_size, &self.destination_urls)
    }
}

impl fmt::Debug for FileUploadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUploadSpec")
            .field("total_size", &self.total_size())
            .field("mime_type", &self.mime_type)
            .field("block_size", &self.block_size)
            .field("destination_urls", &self.destination_urls.len())
            .finish()
    }
}

/// 分片标识（文件索引 + 分片索引）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkKey {
    pub file_index: usize,
    pub chunk_index: usize,
}

impl ChunkKey {
    pub fn new(file_index: usize, chunk_index: usize) -> Self {
        Self {
            file_index,
            chunk_index,
        }
    }
}

/// 分片上传成功记录
#[derive(Debug, Clone)]
pub struct ChunkAttemptRecord {
    pub descriptor: ChunkDescriptor,
    pub attempts_used: u32,
}

/// 单文件上传结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileUploadResult {
    /// 失败的分片（列表语义，不去重）
    pub failed_chunks: Vec<ChunkKey>,
    /// 成功分片的尝试次数（分片索引 -> 尝试次数）
    pub attempt_map: BTreeMap<usize, u32>,
    /// 因取消未执行的分片数
    pub cancelled_chunks: usize,
}

impl FileUploadResult {
    pub fn has_failures(&self) -> bool {
        !self.failed_chunks.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty() && self.cancelled_chunks == 0
    }
}

/// 批量上传结果
#[derive(Debug, Clone, Default)]
pub struct BatchUploadResult {
    /// 失败的文件索引（升序）
    pub failed_files: Vec<usize>,
    /// 失败的分片（列表语义，不去重）
    pub failed_chunks: Vec<ChunkKey>,
    /// 成功分片的尝试次数
    pub attempt_map: BTreeMap<ChunkKey, u32>,
    /// URL 数量与分片数量不一致而被跳过的文件
    pub skipped_files: Vec<usize>,
    /// 因取消未执行的分片数
    pub cancelled_chunks: usize,
    /// 因所属文件已失败而未派发的分片数
    pub not_dispatched_chunks: usize,
}

impl BatchUploadResult {
    pub fn has_failures(&self) -> bool {
        !self.failed_files.is_empty()
    }
}

// =====================================================
// 单分片上传
// =====================================================

/// 上传单个分片的能力
#[async_trait]
pub trait ChunkUploader: Send + Sync {
    async fn upload_chunk(
        &self,
        file: &FileUploadSpec,
        chunk: &ChunkDescriptor,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChunkAttemptRecord, AttemptError>;
}

/// 基于 HTTP PUT 的分片上传
pub struct HttpChunkUploader {
    executor: RetryableRequestExecutor,
    policy: RetryPolicy,
    headers: Arc<dyn HeaderProvider>,
    observer: Option<Arc<dyn AttemptObserver>>,
}

impl HttpChunkUploader {
    pub fn new(
        executor: RetryableRequestExecutor,
        policy: RetryPolicy,
        headers: Arc<dyn HeaderProvider>,
    ) -> Self {
        Self {
            executor,
            policy,
            headers,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

#[async_trait]
impl ChunkUploader for HttpChunkUploader {
    async fn upload_chunk(
        &self,
        file: &FileUploadSpec,
        chunk: &ChunkDescriptor,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChunkAttemptRecord, AttemptError> {
        debug!(
            "[分片#{}] 开始上传 (part={}, 范围: {}-{}, 大小: {} bytes)",
            chunk.index,
            chunk.part_number,
            chunk.range.start,
            chunk.range.end,
            chunk.size()
        );

        let data = file
            .payload
            .read_range(chunk.range.clone())
            .await
            .map_err(|e| AttemptError::new(0, e))?;

        let request = HttpRequest::new(HttpMethod::Put, chunk.url.as_str())
            .header("Content-Type", file.mime_type.as_str())
            .headers(self.headers.headers())
            .body(data);

        let attempted = self
            .executor
            .execute(&request, &self.policy, cancel, self.observer.as_deref())
            .await?;

        Ok(ChunkAttemptRecord {
            descriptor: chunk.clone(),
            attempts_used: attempted.attempts_used,
        })
    }
}

/// 在独立任务中上传分片，uploader 的 panic 转为失败结果
async fn upload_isolated(
    uploader: Arc<dyn ChunkUploader>,
    file: Arc<FileUploadSpec>,
    chunk: ChunkDescriptor,
    cancel: CancellationToken,
) -> std::result::Result<ChunkAttemptRecord, AttemptError> {
    let index = chunk.index;
    run_isolated(async move { uploader.upload_chunk(&file, &chunk, &cancel).await })
        .await
        .unwrap_or_else(|join_err| {
            error!("[分片#{}] 上传任务异常: {}", index, join_err);
            Err(AttemptError::new(
                0,
                UploadError::WorkerPanic(join_err.to_string()),
            ))
        })
}

/// 分片结束时的观察者（统计用，回调中的 panic 会被忽略）
pub trait ChunkObserver: Send + Sync {
    fn on_chunk_success(&self, _file_index: usize, _record: &ChunkAttemptRecord) {}

    fn on_chunk_error(&self, _file_index: usize, _chunk: &ChunkDescriptor, _error: &AttemptError) {}
}

// =====================================================
// 协调器
// =====================================================

/// 单个分片任务的结束状态
enum ChunkSettle {
    Succeeded(ChunkAttemptRecord),
    Failed(AttemptError),
    Cancelled,
    /// 所属文件已失败，未派发
    NotDispatched,
}

/// 分片上传协调器
#[derive(Debug, Clone)]
pub struct ChunkUploadCoordinator {
    /// 单文件模式最大并发分片数
    max_concurrent_chunks: usize,
}

impl ChunkUploadCoordinator {
    pub fn new(max_concurrent_chunks: usize) -> Self {
        Self {
            max_concurrent_chunks: max_concurrent_chunks.max(1),
        }
    }

    /// 单文件模式上传
    ///
    /// 分片之间没有 fail-fast：失败的分片被记录，其他分片继续上传
    pub async fn upload_chunks(
        &self,
        file: Arc<FileUploadSpec>,
        descriptors: Vec<ChunkDescriptor>,
        uploader: Arc<dyn ChunkUploader>,
        cancel: CancellationToken,
    ) -> FileUploadResult {
        if cancel.is_cancelled() {
            info!("上传已取消，不派发任何分片");
            return FileUploadResult::default();
        }

        let chunk_count = descriptors.len();
        info!(
            "[单文件上传] 开始上传 {} 个分片，并发数: {}",
            chunk_count, self.max_concurrent_chunks
        );

        let indexes: Vec<usize> = descriptors.iter().map(|d| d.index).collect();
        let limiter = ConcurrencyLimiter::new(self.max_concurrent_chunks);

        let outcomes = limiter
            .run_bounded(descriptors, move |chunk: ChunkDescriptor| {
                let file = file.clone();
                let uploader = uploader.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Ok::<_, Infallible>(ChunkSettle::Cancelled);
                    }
                    let settle = match upload_isolated(
                        uploader,
                        file,
                        chunk.clone(),
                        cancel,
                    )
                    .await
                    {
                        Ok(record) => {
                            debug!(
                                "[分片#{}] ✓ 上传成功 (尝试 {} 次)",
                                chunk.index, record.attempts_used
                            );
                            ChunkSettle::Succeeded(record)
                        }
                        Err(e) if e.is_cancelled() => ChunkSettle::Cancelled,
                        Err(e) => {
                            error!("[分片#{}] 上传失败: {}", chunk.index, e);
                            ChunkSettle::Failed(e)
                        }
                    };
                    Ok(settle)
                }
            })
            .await;

        let mut result = FileUploadResult::default();
        for (chunk_index, outcome) in indexes.into_iter().zip(outcomes) {
            match outcome {
                UnitOutcome::Completed(ChunkSettle::Succeeded(record)) => {
                    record_max_attempts(&mut result.attempt_map, chunk_index, record.attempts_used);
                }
                UnitOutcome::Completed(ChunkSettle::Failed(_)) | UnitOutcome::Panicked(_) => {
                    result.failed_chunks.push(ChunkKey::new(0, chunk_index));
                }
                UnitOutcome::Completed(ChunkSettle::Cancelled)
                | UnitOutcome::Completed(ChunkSettle::NotDispatched) => {
                    result.cancelled_chunks += 1;
                }
                UnitOutcome::Failed(never) => match never {},
            }
        }

        info!(
            "[单文件上传] 结束: 成功 {}, 失败 {}, 取消 {} (共 {} 个分片)",
            result.attempt_map.len(),
            result.failed_chunks.len(),
            result.cancelled_chunks,
            chunk_count
        );

        result
    }

    /// 批量模式上传
    ///
    /// 所有文件的分片共享 batch_size 个并发槽位；
    /// 文件的任一分片失败后，不再派发该文件的新分片
    pub async fn batch_upload(
        &self,
        files: Vec<Arc<FileUploadSpec>>,
        batch_size: usize,
        uploader: Arc<dyn ChunkUploader>,
        cancel: CancellationToken,
        observer: Option<Arc<dyn ChunkObserver>>,
    ) -> BatchUploadResult {
        let mut result = BatchUploadResult::default();

        // 预检：URL 数量不一致的文件直接跳过
        let mut units: Vec<(usize, Arc<FileUploadSpec>, ChunkDescriptor)> = Vec::new();
        for (file_index, file) in files.iter().enumerate() {
            match file.descriptors() {
                Ok(descriptors) => {
                    for chunk in descriptors {
                        units.push((file_index, file.clone(), chunk));
                    }
                }
                Err(e) => {
                    warn!("[批量上传] 跳过文件 #{}: {}", file_index, e);
                    result.skipped_files.push(file_index);
                }
            }
        }

        if cancel.is_cancelled() {
            info!("上传已取消，不派发任何分片");
            return result;
        }

        info!(
            "[批量上传] 开始上传 {} 个文件 / {} 个分片，全局并发数: {}",
            files.len() - result.skipped_files.len(),
            units.len(),
            batch_size.max(1)
        );

        let keys: Vec<ChunkKey> = units
            .iter()
            .map(|(file_index, _, chunk)| ChunkKey::new(*file_index, chunk.index))
            .collect();

        let failed_files: Arc<DashSet<usize>> = Arc::new(DashSet::new());
        let failed_chunks: Arc<Mutex<Vec<ChunkKey>>> = Arc::new(Mutex::new(Vec::new()));
        let attempt_map: Arc<DashMap<ChunkKey, u32>> = Arc::new(DashMap::new());

        let limiter = ConcurrencyLimiter::new(batch_size);
        let outcomes = {
            let failed_files = failed_files.clone();
            let failed_chunks = failed_chunks.clone();
            let attempt_map = attempt_map.clone();

            limiter
                .run_bounded(units, move |(file_index, file, chunk)| {
                    let failed_files = failed_files.clone();
                    let failed_chunks = failed_chunks.clone();
                    let attempt_map = attempt_map.clone();
                    let uploader = uploader.clone();
                    let cancel = cancel.clone();
                    let observer = observer.clone();

                    async move {
                        let key = ChunkKey::new(file_index, chunk.index);

                        if cancel.is_cancelled() {
                            return Ok::<_, Infallible>(ChunkSettle::Cancelled);
                        }
                        if failed_files.contains(&file_index) {
                            debug!(
                                "[批量上传] 文件 #{} 已失败，跳过分片 #{}",
                                file_index, chunk.index
                            );
                            return Ok(ChunkSettle::NotDispatched);
                        }

                        // panic 也在这里结算，保证释放槽位前文件已标记失败
                        let settle = match upload_isolated(
                            uploader,
                            file,
                            chunk.clone(),
                            cancel,
                        )
                        .await
                        {
                            Ok(record) => {
                                attempt_map
                                    .entry(key)
                                    .and_modify(|a| *a = (*a).max(record.attempts_used))
                                    .or_insert(record.attempts_used);
                                if let Some(obs) = observer.as_deref() {
                                    notify(|| obs.on_chunk_success(file_index, &record));
                                }
                                ChunkSettle::Succeeded(record)
                            }
                            Err(e) if e.is_cancelled() => ChunkSettle::Cancelled,
                            Err(e) => {
                                failed_files.insert(file_index);
                                failed_chunks.lock().push(key);
                                error!(
                                    "[批量上传] 文件 #{} 分片 #{} 上传失败，停止派发该文件的分片: {}",
                                    file_index, chunk.index, e
                                );
                                if let Some(obs) = observer.as_deref() {
                                    notify(|| obs.on_chunk_error(file_index, &chunk, &e));
                                }
                                ChunkSettle::Failed(e)
                            }
                        };
                        Ok(settle)
                    }
                })
                .await
        };

        for (key, outcome) in keys.into_iter().zip(outcomes) {
            match outcome {
                UnitOutcome::Completed(ChunkSettle::Cancelled) => result.cancelled_chunks += 1,
                UnitOutcome::Completed(ChunkSettle::NotDispatched) => {
                    result.not_dispatched_chunks += 1
                }
                UnitOutcome::Panicked(_) => {
                    failed_files.insert(key.file_index);
                    failed_chunks.lock().push(key);
                }
                UnitOutcome::Completed(ChunkSettle::Succeeded(_))
                | UnitOutcome::Completed(ChunkSettle::Failed(_)) => {}
                UnitOutcome::Failed(never) => match never {},
            }
        }

        result.failed_chunks = std::mem::take(&mut *failed_chunks.lock());
        result.attempt_map = attempt_map
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let mut failed: Vec<usize> = failed_files.iter().map(|f| *f).collect();
        failed.sort_unstable();
        result.failed_files = failed;

        info!(
            "[批量上传] 结束: 失败文件 {:?}, 跳过文件 {:?}, 成功分片 {}, 未派发 {}, 取消 {}",
            result.failed_files,
            result.skipped_files,
            result.attempt_map.len(),
            result.not_dispatched_chunks,
            result.cancelled_chunks
        );

        result
    }
}

/// 记录最大尝试次数
fn record_max_attempts(map: &mut BTreeMap<usize, u32>, index: usize, attempts: u32) {
    let entry = map.entry(index).or_insert(attempts);
    if attempts > *entry {
        *entry = attempts;
    }
}

/// 单文件预检：校验并生成分片描述（失败时不发出任何请求）
pub fn preflight(file: &FileUploadSpec) -> Result<Vec<ChunkDescriptor>> {
    file.descriptors()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::payload::MemoryPayload;
    use crate::uploader::testing::{Reply, ScriptedTransport};
    use crate::uploader::transport::StaticHeaders;
    use std::time::Duration;

    fn urls(tag: &str, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://s.example.com/{}?partNumber={}", tag, i + 1))
            .collect()
    }

    fn spec(tag: &str, size: usize, block: u64) -> Arc<FileUploadSpec> {
        let n = expected_chunk_count(size as u64, block);
        Arc::new(FileUploadSpec::new(
            Arc::new(MemoryPayload::new(vec![7u8; size])),
            "image/png",
            block,
            urls(tag, n),
        ))
    }

    fn uploader(transport: Arc<ScriptedTransport>, max_attempts: u32) -> Arc<dyn ChunkUploader> {
        let executor = RetryableRequestExecutor::new(transport, Duration::from_secs(5));
        Arc::new(HttpChunkUploader::new(
            executor,
            RetryPolicy::Exponential {
                max_attempts,
                initial_delay_ms: 10,
            },
            Arc::new(StaticHeaders(vec![(
                "Authorization".to_string(),
                "Bearer test".to_string(),
            )])),
        ))
    }

    #[derive(Default)]
    struct Events {
        successes: Mutex<Vec<ChunkKey>>,
        errors: Mutex<Vec<ChunkKey>>,
    }

    impl ChunkObserver for Events {
        fn on_chunk_success(&self, file_index: usize, record: &ChunkAttemptRecord) {
            self.successes
                .lock()
                .push(ChunkKey::new(file_index, record.descriptor.index));
        }

        fn on_chunk_error(&self, file_index: usize, chunk: &ChunkDescriptor, _e: &AttemptError) {
            self.errors.lock().push(ChunkKey::new(file_index, chunk.index));
        }
    }

    struct PanickingObserver;

    impl ChunkObserver for PanickingObserver {
        fn on_chunk_success(&self, _f: usize, _r: &ChunkAttemptRecord) {
            panic!("observer boom");
        }

        fn on_chunk_error(&self, _f: usize, _c: &ChunkDescriptor, _e: &AttemptError) {
            panic!("observer boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_chunks_first_attempt() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let file = spec("a", 2048, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(4)
            .upload_chunks(
                file,
                descriptors,
                uploader(transport.clone(), 4),
                CancellationToken::new(),
            )
            .await;

        assert!(result.failed_chunks.is_empty());
        assert_eq!(result.attempt_map, BTreeMap::from([(0, 1), (1, 1)]));
        assert!(result.is_complete());

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert_eq!(call.method, HttpMethod::Put);
            assert_eq!(call.body.len(), 1024);
            assert!(call
                .headers
                .iter()
                .any(|(k, v)| k == "Content-Type" && v == "image/png"));
            assert!(call.headers.iter().any(|(k, _)| k == "Authorization"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_chunk_always_failing() {
        let transport = Arc::new(ScriptedTransport::always(500));
        let file = spec("a", 100, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(2)
            .upload_chunks(
                file,
                descriptors,
                uploader(transport.clone(), 4),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(transport.call_count(), 4);
        assert_eq!(result.failed_chunks, vec![ChunkKey::new(0, 0)]);
        assert!(result.attempt_map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_file_no_fail_fast() {
        // 第 1 个分片始终 403，其余分片仍然上传
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.url.ends_with("partNumber=1") {
                Reply::Status(403)
            } else {
                Reply::Status(200)
            }
        }));
        let file = spec("a", 4096, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(1)
            .upload_chunks(
                file,
                descriptors,
                uploader(transport.clone(), 3),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.failed_chunks, vec![ChunkKey::new(0, 0)]);
        assert_eq!(result.attempt_map, BTreeMap::from([(1, 1), (2, 1), (3, 1)]));
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attempts_recorded() {
        let transport = Arc::new(ScriptedTransport::new(|req, n| {
            if req.url.ends_with("partNumber=2") && n < 2 {
                Reply::Status(429)
            } else {
                Reply::Status(200)
            }
        }));
        let file = spec("a", 3000, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(3)
            .upload_chunks(file, descriptors, uploader(transport, 4), CancellationToken::new())
            .await;

        assert_eq!(result.attempt_map, BTreeMap::from([(0, 1), (1, 3), (2, 1)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let file = spec("a", 2048, 1024);
        let descriptors = preflight(&file).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let coordinator = ChunkUploadCoordinator::new(2);
        let result = coordinator
            .upload_chunks(file.clone(), descriptors, uploader(transport.clone(), 4), cancel.clone())
            .await;
        assert_eq!(transport.call_count(), 0);
        assert!(result.failed_chunks.is_empty());
        assert!(result.attempt_map.is_empty());

        let batch = coordinator
            .batch_upload(vec![file], 2, uploader(transport.clone(), 4), cancel, None)
            .await;
        assert_eq!(transport.call_count(), 0);
        assert!(batch.failed_files.is_empty());
        assert!(batch.attempt_map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_dispatch() {
        // 第一个分片上传成功后取消，剩余分片不再派发
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let transport = Arc::new(ScriptedTransport::new(move |_, _| {
            c.cancel();
            Reply::Status(200)
        }));
        let file = spec("a", 4096, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(1)
            .upload_chunks(file, descriptors, uploader(transport.clone(), 4), cancel)
            .await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(result.attempt_map, BTreeMap::from([(0, 1)]));
        assert!(result.failed_chunks.is_empty());
        assert_eq!(result.cancelled_chunks, 3);
    }

    #[test]
    fn test_preflight_mismatch() {
        let file = FileUploadSpec::new(
            Arc::new(MemoryPayload::new(vec![0u8; 2048])),
            "image/png",
            1024,
            urls("a", 3),
        );
        assert!(preflight(&file).unwrap_err().is_config());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fail_fast_per_file() {
        // 文件 A 的第 2 个分片失败，A 的 3..N 分片不再派发；文件 B 正常完成
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.url.contains("/A?partNumber=2") {
                Reply::Status(400)
            } else {
                Reply::Status(200)
            }
        }));
        let events = Arc::new(Events::default());

        let result = ChunkUploadCoordinator::new(4)
            .batch_upload(
                vec![spec("A", 5 * 1024, 1024), spec("B", 3 * 1024, 1024)],
                1,
                uploader(transport.clone(), 3),
                CancellationToken::new(),
                Some(events.clone()),
            )
            .await;

        assert_eq!(result.failed_files, vec![0]);
        assert_eq!(result.failed_chunks, vec![ChunkKey::new(0, 1)]);
        assert_eq!(result.not_dispatched_chunks, 3);
        for i in 3..=5 {
            let url = format!("https://s.example.com/A?partNumber={}", i);
            assert_eq!(transport.calls_to(&url), 0);
        }
        for i in 0..3 {
            assert_eq!(result.attempt_map.get(&ChunkKey::new(1, i)), Some(&1));
        }
        assert_eq!(result.attempt_map.get(&ChunkKey::new(0, 0)), Some(&1));
        assert_eq!(*events.errors.lock(), vec![ChunkKey::new(0, 1)]);
        assert_eq!(events.successes.lock().len(), 4);
    }

    /// 第 2 个分片 panic 的上传实现，记录被派发的分片
    #[derive(Default)]
    struct PanicOnSecondChunk {
        dispatched: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ChunkUploader for PanicOnSecondChunk {
        async fn upload_chunk(
            &self,
            _file: &FileUploadSpec,
            chunk: &ChunkDescriptor,
            _cancel: &CancellationToken,
        ) -> std::result::Result<ChunkAttemptRecord, AttemptError> {
            self.dispatched.lock().push(chunk.index);
            if chunk.index == 1 {
                panic!("uploader boom");
            }
            Ok(ChunkAttemptRecord {
                descriptor: chunk.clone(),
                attempts_used: 1,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_panicking_chunk_fails_file_immediately() {
        let uploader = Arc::new(PanicOnSecondChunk::default());
        let events = Arc::new(Events::default());

        let result = ChunkUploadCoordinator::new(4)
            .batch_upload(
                vec![spec("A", 5 * 1024, 1024)],
                1,
                uploader.clone(),
                CancellationToken::new(),
                Some(events.clone()),
            )
            .await;

        assert_eq!(*uploader.dispatched.lock(), vec![0, 1]);
        assert_eq!(result.failed_files, vec![0]);
        assert_eq!(result.failed_chunks, vec![ChunkKey::new(0, 1)]);
        assert_eq!(result.not_dispatched_chunks, 3);
        assert_eq!(*events.errors.lock(), vec![ChunkKey::new(0, 1)]);
        assert_eq!(*events.successes.lock(), vec![ChunkKey::new(0, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_file_panicking_chunk_counts_as_failed() {
        let uploader = Arc::new(PanicOnSecondChunk::default());
        let file = spec("a", 3 * 1024, 1024);
        let descriptors = preflight(&file).unwrap();

        let result = ChunkUploadCoordinator::new(1)
            .upload_chunks(file, descriptors, uploader.clone(), CancellationToken::new())
            .await;

        assert_eq!(*uploader.dispatched.lock(), vec![0, 1, 2]);
        assert_eq!(result.failed_chunks, vec![ChunkKey::new(0, 1)]);
        assert_eq!(result.attempt_map, BTreeMap::from([(0, 1), (2, 1)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_skips_mismatched_file() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let bad = Arc::new(FileUploadSpec::new(
            Arc::new(MemoryPayload::new(vec![0u8; 2048])),
            "image/jpeg",
            1024,
            urls("bad", 1),
        ));

        let result = ChunkUploadCoordinator::new(4)
            .batch_upload(
                vec![spec("A", 1024, 1024), bad],
                2,
                uploader(transport.clone(), 3),
                CancellationToken::new(),
                None,
            )
            .await;

        assert_eq!(result.skipped_files, vec![1]);
        assert!(result.failed_files.is_empty());
        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.calls_to("https://s.example.com/bad?partNumber=1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_concurrency_shared_across_files() {
        let transport = Arc::new(
            ScriptedTransport::always(200).with_latency(Duration::from_millis(50)),
        );

        let result = ChunkUploadCoordinator::new(8)
            .batch_upload(
                vec![spec("A", 10, 1024), spec("B", 10, 1024), spec("C", 10, 1024)],
                2,
                uploader(transport.clone(), 3),
                CancellationToken::new(),
                None,
            )
            .await;

        assert_eq!(transport.peak_in_flight(), 2);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(result.attempt_map.len(), 3);
        assert!(!result.has_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_observer_panic_does_not_corrupt_result() {
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.url.contains("/B?") {
                Reply::Status(404)
            } else {
                Reply::Status(200)
            }
        }));

        let result = ChunkUploadCoordinator::new(4)
            .batch_upload(
                vec![spec("A", 2048, 1024), spec("B", 1024, 1024)],
                2,
                uploader(transport, 3),
                CancellationToken::new(),
                Some(Arc::new(PanickingObserver)),
            )
            .await;

        assert_eq!(result.failed_files, vec![1]);
        assert_eq!(result.failed_chunks, vec![ChunkKey::new(1, 0)]);
        assert_eq!(result.attempt_map.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cancelled_chunks_not_reported_as_errors() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let transport = Arc::new(ScriptedTransport::new(move |_, _| {
            c.cancel();
            Reply::Status(200)
        }));
        let events = Arc::new(Events::default());

        let result = ChunkUploadCoordinator::new(4)
            .batch_upload(
                vec![spec("A", 3072, 1024)],
                1,
                uploader(transport, 3),
                cancel,
                Some(events.clone()),
            )
            .await;

        assert_eq!(result.cancelled_chunks, 2);
        assert!(result.failed_files.is_empty());
        assert!(events.errors.lock().is_empty());
    }
}
