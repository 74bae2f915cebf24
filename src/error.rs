// 上传引擎错误类型
//
// 错误分类：
// 1. 配置错误（分片数与 URL 数不一致）：预检阶段直接失败，不重试
// 2. 可重试错误（429/202/5xx、超时、网络错误）：按重试策略处理，耗尽后转为终止错误
// 3. 终止错误（其他非 2xx 状态码）：不重试
// 4. 取消：不算成功也不算失败

use std::time::Duration;
use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 配置错误（预检失败，未发出任何请求）
    #[error("配置错误: {0}")]
    Config(String),

    /// 上传已取消
    #[error("上传已取消")]
    Cancelled,

    /// 服务器返回不可重试的状态码
    #[error("请求失败: status={status}, {message}")]
    Terminal { status: u16, message: String },

    /// 重试次数耗尽
    #[error("已达最大重试次数 ({attempts}), 最后状态码: {last_status:?}")]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
    },

    /// 网络错误（DNS、连接失败等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 请求超时
    #[error("请求超时 ({0:?})")]
    Timeout(Duration),

    /// 轮询等待时间超过上限
    #[error("轮询等待超过上限 ({waited_ms}ms): {url}")]
    MaxWaitExceeded { url: String, waited_ms: u64 },

    /// 读取分片数据失败
    #[error("读取上传数据失败: {0}")]
    Payload(String),

    /// 解析响应失败
    #[error("解析响应失败: {0}")]
    Decode(String),

    /// 上传任务异常退出（panic）
    #[error("上传任务异常: {0}")]
    WorkerPanic(String),
}

impl UploadError {
    /// 是否为取消（取消不计入失败统计）
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 是否为预检配置错误
    pub fn is_config(&self) -> bool {
        matches!(self, UploadError::Config(_))
    }

    /// 关联的 HTTP 状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Terminal { status, .. } => Some(*status),
            UploadError::RetriesExhausted { last_status, .. } => *last_status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Payload(e.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::Decode(e.to_string())
    }
}

/// 带尝试次数的失败（重试执行器与分片上传共用）
#[derive(Debug, Clone, Error)]
#[error("尝试 {attempts_used} 次后失败: {error}")]
pub struct AttemptError {
    /// 已消耗的尝试次数
    pub attempts_used: u32,
    /// 失败原因
    pub error: UploadError,
}

impl AttemptError {
    pub fn new(attempts_used: u32, error: UploadError) -> Self {
        Self {
            attempts_used,
            error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
