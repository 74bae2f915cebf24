// 配置管理模块

use crate::uploader::chunk::DEFAULT_BLOCK_SIZE;
use crate::uploader::executor::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 分片上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 上传完成后的安全扫描配置
    #[serde(default)]
    pub finalize: FinalizeConfig,
    /// 上传端点配置（请求头）
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 分片上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节）
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// 批量模式全局并发分片数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 单文件模式最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 分片请求的重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_batch_size() -> usize {
    4
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            batch_size: default_batch_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 安全扫描（finalize）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// 扫描接口地址，未配置时跳过扫描
    #[serde(default)]
    pub url: Option<String>,
    /// 目标产品标识
    #[serde(default = "default_target_product")]
    pub target_product: String,
    /// 轮询策略
    #[serde(default = "RetryPolicy::default_polling")]
    pub polling: RetryPolicy,
}

fn default_target_product() -> String {
    "ASSET_STORE".to_string()
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            url: None,
            target_product: default_target_product(),
            polling: RetryPolicy::default_polling(),
        }
    }
}

/// 上传端点配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 附加到每个请求的静态请求头（例如 Authorization）
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EndpointConfig {
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.block_size == 0 {
            anyhow::bail!("upload.block_size 不能为 0");
        }
        if self.upload.batch_size == 0 {
            anyhow::bail!("upload.batch_size 不能为 0");
        }
        if self.upload.max_concurrent_chunks == 0 {
            anyhow::bail!("upload.max_concurrent_chunks 不能为 0");
        }
        if self.upload.request_timeout_secs == 0 {
            anyhow::bail!("upload.request_timeout_secs 不能为 0");
        }
        if !self.finalize.polling.is_polling() {
            anyhow::bail!("finalize.polling 必须是 polling 策略");
        }
        if let Some(url) = &self.finalize.url {
            reqwest::Url::parse(url)
                .with_context(|| format!("finalize.url 不是合法的 URL: {}", url))?;
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 配置文件不存在时写出默认配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
