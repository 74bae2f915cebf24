// 上传数据源
//
// 提供已知总大小、可按字节范围读取的数据源：
// - MemoryPayload：内存中的字节
// - FilePayload：本地文件（spawn_blocking + seek 读取分片）

use crate::error::{Result, UploadError};
use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 可按范围读取的上传数据源
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// 数据总大小
    fn total_size(&self) -> u64;

    /// 读取指定字节范围
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemoryPayload {
    data: Arc<Vec<u8>>,
}

impl MemoryPayload {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

impl From<Vec<u8>> for MemoryPayload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

#[async_trait]
impl PayloadSource for MemoryPayload {
    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let len = self.data.len() as u64;
        if range.start > range.end || range.end > len {
            return Err(UploadError::Payload(format!(
                "读取范围越界: {}-{}, 数据大小={}",
                range.start, range.end, len
            )));
        }
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
    size: u64,
}

impl FilePayload {
    /// 打开本地文件（读取元数据获得文件大小）
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| UploadError::Payload(format!("无法读取文件信息 {:?}: {}", path, e)))?;

        if !metadata.is_file() {
            return Err(UploadError::Payload(format!("不是普通文件: {:?}", path)));
        }

        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PayloadSource for FilePayload {
    fn total_size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        if range.start > range.end || range.end > self.size {
            return Err(UploadError::Payload(format!(
                "读取范围越界: {}-{}, 文件大小={}",
                range.start, range.end, self.size
            )));
        }

        let path = self.path.clone();
        let start = range.start;
        let size = (range.end - range.start) as usize;

        let buffer = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file = std::fs::File::open(&path)
                .map_err(|e| UploadError::Payload(format!("无法打开文件 {:?}: {}", path, e)))?;
            file.seek(SeekFrom::Start(start))?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer)?;

            Ok(buffer)
        })
        .await
        .map_err(|e| UploadError::Payload(format!("读取任务异常: {}", e)))??;

        debug!(
            "读取分片数据: {:?}, bytes={}-{}, 大小={} bytes",
            self.path,
            range.start,
            range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}
