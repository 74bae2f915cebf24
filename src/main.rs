use anyhow::{Context, Result};
use asset_chunk_uploader::{
    config::AppConfig,
    logging,
    uploader::{FilePayload, FileUploadSpec, ReqwestTransport, UploadOrchestrator, UploadOutcome},
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const USAGE: &str = "用法: asset-uploader <config.toml> <file> <mime> <urls.txt> [asset_id]";

/// 读取分片目标 URL（每行一个，忽略空行与 # 注释）
async fn read_destination_urls(path: &str) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取 URL 列表失败: {}", path))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn outcome_summary(outcome: &UploadOutcome) -> serde_json::Value {
    let (status, scan, error) = match outcome {
        UploadOutcome::Completed { scan, .. } => ("completed", scan.clone(), None),
        UploadOutcome::ChunksFailed(_) => ("chunks_failed", None, None),
        UploadOutcome::FinalizeFailed { error, .. } => {
            ("finalize_failed", None, Some(error.to_string()))
        }
        UploadOutcome::Cancelled(_) => ("cancelled", None, None),
    };

    json!({
        "status": status,
        "result": outcome.result(),
        "scan": scan,
        "error": error,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }
    let (config_path, file_path, mime_type, urls_path) = (&args[0], &args[1], &args[2], &args[3]);
    let asset_id = args.get(4).map(String::as_str);

    let config = AppConfig::load_or_default(config_path).await;

    // 初始化日志系统（必须保持 log_guard 存活）
    let log_guard = logging::init_logging(&config.log);

    info!("asset-uploader v{} 启动", env!("CARGO_PKG_VERSION"));

    let payload = FilePayload::open(file_path)
        .await
        .with_context(|| format!("打开上传文件失败: {}", file_path))?;
    let urls = read_destination_urls(urls_path).await?;

    let transport = ReqwestTransport::new(config.upload.request_timeout())
        .context("创建 HTTP 客户端失败")?;
    let orchestrator = UploadOrchestrator::new(&config, Arc::new(transport));

    let spec = FileUploadSpec::new(
        Arc::new(payload),
        mime_type.as_str(),
        orchestrator.block_size(),
        urls,
    );

    // Ctrl+C 只停止派发新的分片，已发出的请求会完成
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，停止派发新的分片...");
            signal_cancel.cancel();
        }
    });

    let outcome = orchestrator
        .upload_file(spec, asset_id, &cancel)
        .await
        .context("上传失败")?;

    let summary = serde_json::to_string_pretty(&outcome_summary(&outcome))
        .context("序列化上传结果失败")?;
    println!("{}", summary);

    if !outcome.is_success() {
        // 退出前刷新日志文件
        drop(log_guard);
        std::process::exit(1);
    }

    Ok(())
}
