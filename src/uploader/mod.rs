// 上传引擎模块
//
// - 分片规划：按固定大小切分，校验 URL 数量
// - 可重试请求：指数退避 / 服务器驱动的轮询
// - 有界并发：Semaphore + JoinSet
// - 分片协调：单文件模式与批量模式（按文件 fail-fast）

pub mod chunk;
pub mod coordinator;
pub mod executor;
pub mod limiter;
pub mod orchestrator;
pub mod outcome;
pub mod payload;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use chunk::{
    build_descriptors, expected_chunk_count, plan_chunks, resolve_part_number,
    validate_chunk_count, ChunkDescriptor, DEFAULT_BLOCK_SIZE,
};
pub use coordinator::{
    BatchUploadResult, ChunkAttemptRecord, ChunkKey, ChunkObserver, ChunkUploadCoordinator,
    ChunkUploader, FileUploadResult, FileUploadSpec, HttpChunkUploader,
};
pub use executor::{AttemptObserver, Attempted, RetryPolicy, RetryableRequestExecutor};
pub use limiter::{run_bounded, ConcurrencyLimiter, UnitOutcome};
pub use orchestrator::{UploadOrchestrator, UploadOutcome};
pub use outcome::{RequestOutcome, SuccessStatus};
pub use payload::{FilePayload, MemoryPayload, PayloadSource};
pub use transport::{
    HeaderProvider, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
    StaticHeaders, TransportError,
};
