// 上传分片规划
//
// 分片规则：
// - 按固定 block_size 切分，分片之间连续、不重叠
// - 最后一个分片长度为 total_size % block_size（整除时为完整分片）
// - 每个分片对应一个目标 URL，URL 数量必须等于 ceil(total_size / block_size)
// - 分片编号（partNumber）从 URL 查询参数解析，仅用于日志关联

use crate::error::{Result, UploadError};
use reqwest::Url;
use std::ops::Range;
use tracing::{debug, info};

/// 默认分片大小: 4MB
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// URL 中分片编号的查询参数名
pub const PART_NUMBER_PARAM: &str = "partNumber";

/// 上传分片描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 分片编号（来自 URL 的 partNumber，缺失时等于索引）
    pub part_number: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
    /// 目标 URL
    pub url: String,
}

impl ChunkDescriptor {
    pub fn new(index: usize, range: Range<u64>, url: impl Into<String>) -> Self {
        let url = url.into();
        let part_number = resolve_part_number(&url, index);
        Self {
            index,
            part_number,
            range,
            url,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 计算预期分片数量
pub fn expected_chunk_count(total_size: u64, block_size: u64) -> usize {
    if block_size == 0 {
        return 0;
    }
    total_size.div_ceil(block_size) as usize
}

/// 计算分片字节范围
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `block_size` - 分片大小（必须大于 0）
pub fn plan_chunks(total_size: u64, block_size: u64) -> Result<Vec<Range<u64>>> {
    if block_size == 0 {
        return Err(UploadError::Config("分片大小必须大于 0".to_string()));
    }

    let mut ranges = Vec::with_capacity(expected_chunk_count(total_size, block_size));
    let mut offset = 0u64;

    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(block_size), total_size);
        ranges.push(offset..end);
        offset = end;
    }

    Ok(ranges)
}

/// 校验目标 URL 数量与分片数量是否一致
///
/// 必须在派发任何分片之前调用，失败属于配置错误，不会重试
pub fn validate_chunk_count(destination_urls: &[String], expected_chunk_count: usize) -> Result<()> {
    if destination_urls.len() != expected_chunk_count {
        return Err(UploadError::Config(format!(
            "目标 URL 数量 ({}) 与分片数量 ({}) 不一致",
            destination_urls.len(),
            expected_chunk_count
        )));
    }
    Ok(())
}

/// 从 URL 解析分片编号
///
/// 优先使用 `partNumber` 查询参数，缺失或无法解析时返回 `fallback_index`
pub fn resolve_part_number(url: &str, fallback_index: usize) -> usize {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == PART_NUMBER_PARAM)
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        })
        .unwrap_or(fallback_index)
}

/// 生成分片描述列表（先校验再切分）
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `block_size` - 分片大小
/// * `destination_urls` - 每个分片的目标 URL
pub fn build_descriptors(
    total_size: u64,
    block_size: u64,
    destination_urls: &[String],
) -> Result<Vec<ChunkDescriptor>> {
    let ranges = plan_chunks(total_size, block_size)?;
    validate_chunk_count(destination_urls, ranges.len())?;

    let descriptors: Vec<ChunkDescriptor> = ranges
        .into_iter()
        .zip(destination_urls.iter())
        .enumerate()
        .map(|(index, (range, url))| ChunkDescriptor::new(index, range, url.as_str()))
        .collect();

    for d in &descriptors {
        debug!(
            "分片 #{} (part={}): bytes={}-{}, 大小={} bytes",
            d.index,
            d.part_number,
            d.range.start,
            d.range.end,
            d.size()
        );
    }

    info!(
        "分片规划完成: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        total_size,
        block_size,
        descriptors.len()
    );

    Ok(descriptors)
}
