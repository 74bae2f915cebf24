// Chunked Asset Upload Library
// 分片上传引擎核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::{AttemptError, UploadError};
pub use uploader::{
    BatchUploadResult, ChunkDescriptor, ChunkKey, ChunkUploadCoordinator, FileUploadResult,
    FileUploadSpec, RetryPolicy, RetryableRequestExecutor, UploadOrchestrator, UploadOutcome,
};
