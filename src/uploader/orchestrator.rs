// 上传编排
//
// 一次完整上传：预检 -> 单文件分片上传 -> 安全扫描（finalize，轮询策略）
// 批量上传只负责分片，不做扫描

use crate::config::{AppConfig, FinalizeConfig};
use crate::error::{Result, UploadError};
use crate::uploader::coordinator::{
    preflight, BatchUploadResult, ChunkObserver, ChunkUploadCoordinator, ChunkUploader,
    FileUploadResult, FileUploadSpec, HttpChunkUploader,
};
use crate::uploader::executor::{AttemptObserver, RetryableRequestExecutor};
use crate::uploader::transport::{
    HeaderProvider, HttpMethod, HttpRequest, HttpTransport, StaticHeaders,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 扫描请求体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeRequest<'a> {
    asset_id: &'a str,
    target_product: &'a str,
}

/// 单文件上传结果
#[derive(Debug)]
pub enum UploadOutcome {
    /// 全部分片成功（scan 为扫描接口返回的 JSON，未配置扫描时为 None）
    Completed {
        result: FileUploadResult,
        scan: Option<Value>,
    },
    /// 有分片失败，未执行扫描
    ChunksFailed(FileUploadResult),
    /// 分片全部成功，但扫描失败
    FinalizeFailed {
        result: FileUploadResult,
        error: UploadError,
    },
    /// 上传过程中被取消
    Cancelled(FileUploadResult),
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Completed { .. })
    }

    pub fn result(&self) -> &FileUploadResult {
        match self {
            UploadOutcome::Completed { result, .. }
            | UploadOutcome::ChunksFailed(result)
            | UploadOutcome::FinalizeFailed { result, .. }
            | UploadOutcome::Cancelled(result) => result,
        }
    }
}

/// 上传编排器
pub struct UploadOrchestrator {
    coordinator: ChunkUploadCoordinator,
    uploader: Arc<dyn ChunkUploader>,
    /// 扫描请求执行器（轮询策略）
    finalize_executor: RetryableRequestExecutor,
    finalize: FinalizeConfig,
    headers: Arc<dyn HeaderProvider>,
    batch_size: usize,
    block_size: u64,
}

impl UploadOrchestrator {
    /// 根据配置创建编排器
    pub fn new(config: &AppConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self::build(config, transport, None)
    }

    /// 创建带请求级观察者的编排器
    pub fn with_observer(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        observer: Arc<dyn AttemptObserver>,
    ) -> Self {
        Self::build(config, transport, Some(observer))
    }

    fn build(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        observer: Option<Arc<dyn AttemptObserver>>,
    ) -> Self {
        let headers: Arc<dyn HeaderProvider> =
            Arc::new(StaticHeaders(config.endpoint.header_pairs()));
        let timeout = config.upload.request_timeout();

        let chunk_executor = RetryableRequestExecutor::new(transport.clone(), timeout);
        let mut uploader =
            HttpChunkUploader::new(chunk_executor, config.upload.retry.clone(), headers.clone());
        if let Some(obs) = observer {
            uploader = uploader.with_observer(obs);
        }

        let finalize_executor = RetryableRequestExecutor::new(transport, timeout);

        Self {
            coordinator: ChunkUploadCoordinator::new(config.upload.max_concurrent_chunks),
            uploader: Arc::new(uploader),
            finalize_executor,
            finalize: config.finalize.clone(),
            headers,
            batch_size: config.upload.batch_size,
            block_size: config.upload.block_size,
        }
    }

    /// 使用自定义的分片上传实现
    pub fn with_uploader(mut self, uploader: Arc<dyn ChunkUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    /// 配置的分片大小
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// 上传单个文件，成功后执行安全扫描
    ///
    /// # 错误
    /// - 已取消：`UploadError::Cancelled`
    /// - URL 数量与分片数量不一致：`UploadError::Config`（不发出任何请求）
    ///
    /// 分片失败与扫描失败通过 `UploadOutcome` 返回
    pub async fn upload_file(
        &self,
        spec: FileUploadSpec,
        asset_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let descriptors = preflight(&spec)?;
        info!(
            "开始上传: {} bytes, {} 个分片, 分片大小 {} bytes",
            spec.total_size(),
            descriptors.len(),
            spec.block_size
        );

        let result = self
            .coordinator
            .upload_chunks(
                Arc::new(spec),
                descriptors,
                self.uploader.clone(),
                cancel.clone(),
            )
            .await;

        if result.has_failures() {
            error!("上传失败: {} 个分片失败", result.failed_chunks.len());
            return Ok(UploadOutcome::ChunksFailed(result));
        }
        if result.cancelled_chunks > 0 {
            warn!("上传已取消: {} 个分片未执行", result.cancelled_chunks);
            return Ok(UploadOutcome::Cancelled(result));
        }

        let asset_id = match (asset_id, self.finalize.url.as_deref()) {
            (Some(id), Some(_)) => id,
            _ => {
                info!("✓ 上传完成（跳过安全扫描）");
                return Ok(UploadOutcome::Completed { result, scan: None });
            }
        };

        match self.finalize(asset_id, cancel).await {
            Ok(scan) => {
                info!("✓ 上传完成，安全扫描通过: asset_id={}", asset_id);
                Ok(UploadOutcome::Completed {
                    result,
                    scan: Some(scan),
                })
            }
            Err(e) if e.is_cancelled() => Ok(UploadOutcome::Cancelled(result)),
            Err(e) => {
                error!("安全扫描失败: asset_id={}, {}", asset_id, e);
                Ok(UploadOutcome::FinalizeFailed { result, error: e })
            }
        }
    }

    /// 批量上传多个文件（所有分片共享 batch_size 个并发槽位）
    pub async fn upload_batch(
        &self,
        files: Vec<FileUploadSpec>,
        cancel: &CancellationToken,
        observer: Option<Arc<dyn ChunkObserver>>,
    ) -> Result<BatchUploadResult> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let files = files.into_iter().map(Arc::new).collect();
        Ok(self
            .coordinator
            .batch_upload(
                files,
                self.batch_size,
                self.uploader.clone(),
                cancel.clone(),
                observer,
            )
            .await)
    }

    /// 安全扫描：POST {assetId, targetProduct}，按轮询策略等待结果
    ///
    /// 返回扫描接口的 JSON 响应（空响应体为 Null）
    pub async fn finalize(&self, asset_id: &str, cancel: &CancellationToken) -> Result<Value> {
        let url = self
            .finalize
            .url
            .as_deref()
            .ok_or_else(|| UploadError::Config("未配置安全扫描地址".to_string()))?;

        let body = serde_json::to_vec(&FinalizeRequest {
            asset_id,
            target_product: &self.finalize.target_product,
        })?;

        let request = HttpRequest::new(HttpMethod::Post, url)
            .header("Content-Type", "application/json")
            .headers(self.headers.headers())
            .body(body);

        info!("开始安全扫描: asset_id={}", asset_id);
        let attempted = self
            .finalize_executor
            .execute(&request, &self.finalize.polling, cancel, None)
            .await
            .map_err(|e| e.error)?;

        let response = attempted.value;
        if response.body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&response.body)?)
    }
}
