//! 日志系统配置
//!
//! 支持控制台输出和文件持久化，按天滚动，启动时自动清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀（完整文件名: asset-uploader.YYYY-MM-DD.log）
const LOG_FILE_PREFIX: &str = "asset-uploader";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    // 环境变量 RUST_LOG 优先于配置
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // 控制台输出层
    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();

        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    // 确保日志目录存在
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        // 回退到只使用控制台输出
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        return LogGuard { _file_guard: None };
    }

    // 按天滚动: asset-uploader.YYYY-MM-DD.log
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(&config.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
            return LogGuard { _file_guard: None };
        }
    };
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件，返回删除的文件数
///
/// 日期取自文件名（asset-uploader.YYYY-MM-DD.log），无法解析时使用修改时间
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let now = Local::now().date_naive();
    let retention_duration = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let filename = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };

        // 只处理本程序的日志文件
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log") {
            continue;
        }

        let should_delete = match extract_date_from_filename(filename)
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        {
            Some(file_date) => now.signed_duration_since(file_date) > retention_duration,
            // 无法解析日期，使用文件修改时间作为后备方案
            None => check_by_modified_time(&entry, retention_days),
        };

        if should_delete {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    deleted_count
}

/// 从文件名中提取日期部分
///
/// asset-uploader.YYYY-MM-DD.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<&str> {
    filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")
}

/// 根据文件修改时间检查是否过期（后备方案）
fn check_by_modified_time(entry: &fs::DirEntry, retention_days: u32) -> bool {
    let now = chrono::Utc::now();
    let retention_duration = chrono::Duration::days(retention_days as i64);

    if let Ok(metadata) = entry.metadata() {
        if let Ok(modified) = metadata.modified() {
            let modified_datetime: chrono::DateTime<chrono::Utc> = modified.into();
            let age = now.signed_duration_since(modified_datetime);
            return age > retention_duration;
        }
    }

    false
}
