// 可重试请求执行器
//
// 核心功能：
// 1. 单次请求：发送前检查取消，硬超时，结果分类
// 2. 指数退避重试：按尝试次数限制，延迟逐次翻倍
// 3. 轮询重试：按累计等待时间限制，优先使用服务器给出的 Retry-After
//
// 观察者回调只用于统计，不影响重试与分类逻辑

use crate::error::{AttemptError, UploadError};
use crate::uploader::outcome::{RequestOutcome, SuccessStatus};
use crate::uploader::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// =====================================================
// 重试策略
// =====================================================

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

/// 默认轮询总等待上限（毫秒）
pub const DEFAULT_MAX_TOTAL_WAIT_MS: u64 = 60_000;

/// 默认轮询间隔（毫秒）
pub const DEFAULT_POLL_DELAY_MS: u64 = 2_000;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// 指数退避：最多 max_attempts 次，第 k 次失败后等待 initial_delay_ms * 2^(k-1)
    Exponential {
        max_attempts: u32,
        initial_delay_ms: u64,
    },
    /// 轮询：累计等待不超过 max_total_wait_ms，间隔取 Retry-After 或 default_delay_ms
    Polling {
        max_total_wait_ms: u64,
        default_delay_ms: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// 默认轮询策略
    pub fn default_polling() -> Self {
        RetryPolicy::Polling {
            max_total_wait_ms: DEFAULT_MAX_TOTAL_WAIT_MS,
            default_delay_ms: DEFAULT_POLL_DELAY_MS,
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, RetryPolicy::Polling { .. })
    }
}

/// 计算指数退避延迟
///
/// # 延迟序列（initial=100）
/// - attempt=1: 100ms
/// - attempt=2: 200ms
/// - attempt=3: 400ms
pub fn backoff_delay(initial_delay_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    Duration::from_millis(initial_delay_ms.saturating_mul(factor))
}

// =====================================================
// 观察者
// =====================================================

/// 单次尝试的观察者（统计用）
pub trait AttemptObserver: Send + Sync {
    fn on_attempt_success(&self, _request: &HttpRequest, _attempt: u32, _status: u16) {}

    fn on_attempt_failure(&self, _request: &HttpRequest, _attempt: u32, _outcome: &RequestOutcome) {}
}

/// 观察者回调中的 panic 不能影响重试逻辑
pub(crate) fn notify(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("观察者回调异常，已忽略");
    }
}

/// 带尝试次数的结果
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts_used: u32,
}

// =====================================================
// 执行器
// =====================================================

/// 可重试请求执行器
#[derive(Clone)]
pub struct RetryableRequestExecutor {
    transport: Arc<dyn HttpTransport>,
    /// 单次请求超时
    timeout: Duration,
    /// 成功状态码判定
    success: SuccessStatus,
}

impl RetryableRequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            success: SuccessStatus::default(),
        }
    }

    pub fn with_success_status(mut self, success: SuccessStatus) -> Self {
        self.success = success;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 发送单次请求并分类
    pub async fn execute_once(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        if cancel.is_cancelled() {
            return RequestOutcome::Aborted;
        }

        match tokio::time::timeout(self.timeout, self.transport.send(request.clone())).await {
            Ok(Ok(response)) => RequestOutcome::classify(response, self.success),
            Ok(Err(TransportError::Timeout)) | Err(_) => RequestOutcome::Timeout,
            Ok(Err(TransportError::Network(msg))) => RequestOutcome::NetworkError(msg),
        }
    }

    /// 按策略执行
    pub async fn execute(
        &self,
        request: &HttpRequest,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        observer: Option<&dyn AttemptObserver>,
    ) -> Result<Attempted<HttpResponse>, AttemptError> {
        match *policy {
            RetryPolicy::Exponential {
                max_attempts,
                initial_delay_ms,
            } => {
                self.execute_exponential(request, max_attempts, initial_delay_ms, cancel, observer)
                    .await
            }
            RetryPolicy::Polling {
                max_total_wait_ms,
                default_delay_ms,
            } => {
                self.execute_polling(request, max_total_wait_ms, default_delay_ms, cancel, observer)
                    .await
            }
        }
    }

    /// 指数退避重试
    ///
    /// 成功立即返回；终止错误与取消不重试；
    /// 最后一次仍为可重试结果时转为 RetriesExhausted（携带最后的状态码）
    pub async fn execute_exponential(
        &self,
        request: &HttpRequest,
        max_attempts: u32,
        initial_delay_ms: u64,
        cancel: &CancellationToken,
        observer: Option<&dyn AttemptObserver>,
    ) -> Result<Attempted<HttpResponse>, AttemptError> {
        let max_attempts = max_attempts.max(1);
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let outcome = self.execute_once(request, cancel).await;

            match outcome {
                RequestOutcome::Success(response) => {
                    if let Some(obs) = observer {
                        notify(|| obs.on_attempt_success(request, attempt, response.status));
                    }
                    debug!(
                        "请求成功: {} (第 {}/{} 次)",
                        request.url, attempt, max_attempts
                    );
                    return Ok(Attempted {
                        value: response,
                        attempts_used: attempt,
                    });
                }
                RequestOutcome::Aborted => {
                    debug!("请求已取消: {}", request.url);
                    return Err(AttemptError::new(attempt - 1, UploadError::Cancelled));
                }
                RequestOutcome::TerminalError { status, message } => {
                    let outcome = RequestOutcome::TerminalError {
                        status,
                        message: message.clone(),
                    };
                    if let Some(obs) = observer {
                        notify(|| obs.on_attempt_failure(request, attempt, &outcome));
                    }
                    error!(
                        "请求失败（不可重试）: {}, status={}, {}",
                        request.url, status, message
                    );
                    return Err(AttemptError::new(
                        attempt,
                        UploadError::Terminal { status, message },
                    ));
                }
                retryable => {
                    if let Some(obs) = observer {
                        notify(|| obs.on_attempt_failure(request, attempt, &retryable));
                    }
                    if let Some(status) = retryable.status() {
                        last_status = Some(status);
                    }

                    if attempt < max_attempts {
                        let delay = backoff_delay(initial_delay_ms, attempt);
                        warn!(
                            "请求失败，等待 {}ms 后重试 ({}/{}): {}, {}",
                            delay.as_millis(),
                            attempt,
                            max_attempts,
                            request.url,
                            retryable.label()
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            "请求失败 ({}/{}): {}, {}",
                            attempt,
                            max_attempts,
                            request.url,
                            retryable.label()
                        );
                    }
                }
            }
        }

        error!(
            "请求失败，已达最大尝试次数 ({}): {}",
            max_attempts, request.url
        );

        Err(AttemptError::new(
            max_attempts,
            UploadError::RetriesExhausted {
                attempts: max_attempts,
                last_status,
            },
        ))
    }

    /// 轮询重试
    ///
    /// 只有繁忙结果会继续轮询，其他结果立即结束；
    /// 累计等待达到 max_total_wait_ms 后返回 MaxWaitExceeded
    pub async fn execute_polling(
        &self,
        request: &HttpRequest,
        max_total_wait_ms: u64,
        default_delay_ms: u64,
        cancel: &CancellationToken,
        observer: Option<&dyn AttemptObserver>,
    ) -> Result<Attempted<HttpResponse>, AttemptError> {
        let mut waited_ms = 0u64;
        let mut attempt = 0u32;

        while waited_ms < max_total_wait_ms {
            attempt += 1;
            let outcome = self.execute_once(request, cancel).await;

            if let Some(obs) = observer {
                match &outcome {
                    RequestOutcome::Success(response) => {
                        notify(|| obs.on_attempt_success(request, attempt, response.status))
                    }
                    RequestOutcome::Aborted => {}
                    other => notify(|| obs.on_attempt_failure(request, attempt, other)),
                }
            }

            let error = match outcome {
                RequestOutcome::Success(response) => {
                    debug!("轮询成功: {} (第 {} 次)", request.url, attempt);
                    return Ok(Attempted {
                        value: response,
                        attempts_used: attempt,
                    });
                }
                RequestOutcome::RetryableBusy {
                    status,
                    retry_after,
                } => {
                    // 至少 1ms，保证累计等待单调增长
                    let delay_ms = retry_after
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(default_delay_ms)
                        .max(1);
                    debug!(
                        "服务器繁忙 (status={}), {}ms 后继续轮询: {} (已等待 {}ms)",
                        status, delay_ms, request.url, waited_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    waited_ms = waited_ms.saturating_add(delay_ms);
                    // 等待期间被取消时以取消结束，而不是等待超限
                    if cancel.is_cancelled() {
                        debug!("轮询已取消: {} (已等待 {}ms)", request.url, waited_ms);
                        return Err(AttemptError::new(attempt, UploadError::Cancelled));
                    }
                    continue;
                }
                RequestOutcome::Aborted => {
                    return Err(AttemptError::new(attempt - 1, UploadError::Cancelled));
                }
                RequestOutcome::TerminalError { status, message } => {
                    UploadError::Terminal { status, message }
                }
                RequestOutcome::NetworkError(msg) => UploadError::Network(msg),
                RequestOutcome::Timeout => UploadError::Timeout(self.timeout),
            };

            error!("轮询失败: {}, {}", request.url, error);
            return Err(AttemptError::new(attempt, error));
        }

        error!(
            "轮询超过最大等待时间 ({}ms): {}",
            max_total_wait_ms, request.url
        );

        Err(AttemptError::new(
            attempt,
            UploadError::MaxWaitExceeded {
                url: request.url.clone(),
                waited_ms,
            },
        ))
    }
}
