// 单次请求结果分类
//
// 分类规则（只取决于状态码/异常类型）：
// - 429、202、5xx：服务器繁忙，可重试
// - 调用方指定的成功状态码：成功
// - 其他状态码：终止错误，不重试
// - 超时、网络错误：可重试
// - 发送前已取消：Aborted

use crate::uploader::transport::HttpResponse;
use std::time::Duration;

/// 终止错误中保留的响应体最大长度
const MAX_ERROR_MESSAGE_LEN: usize = 200;

/// 成功状态码判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessStatus {
    /// 仅接受指定状态码
    Exact(u16),
    /// 接受 2xx（202 仍视为繁忙）
    AnyTwoHundred,
}

impl Default for SuccessStatus {
    fn default() -> Self {
        SuccessStatus::Exact(200)
    }
}

impl SuccessStatus {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            SuccessStatus::Exact(expected) => status == *expected,
            SuccessStatus::AnyTwoHundred => (200..300).contains(&status),
        }
    }
}

/// 单次请求结果
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// 成功
    Success(HttpResponse),
    /// 服务器繁忙（可重试），附带服务器建议的等待时间
    RetryableBusy {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// 终止错误（不可重试）
    TerminalError { status: u16, message: String },
    /// 发送前已取消
    Aborted,
    /// 网络错误（可重试）
    NetworkError(String),
    /// 超时（可重试）
    Timeout,
}

/// 是否为繁忙状态码（429、202、5xx）
pub fn is_busy_status(status: u16) -> bool {
    status == 429 || status == 202 || (500..600).contains(&status)
}

/// 解析 Retry-After（整数秒）
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

impl RequestOutcome {
    /// 对已完成的响应进行分类
    pub fn classify(response: HttpResponse, success: SuccessStatus) -> Self {
        let status = response.status;

        if is_busy_status(status) {
            let retry_after = response.header("retry-after").and_then(parse_retry_after);
            return RequestOutcome::RetryableBusy {
                status,
                retry_after,
            };
        }

        if success.matches(status) {
            return RequestOutcome::Success(response);
        }

        let mut message = response.text();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut cut = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }

        RequestOutcome::TerminalError { status, message }
    }

    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestOutcome::RetryableBusy { .. }
                | RequestOutcome::NetworkError(_)
                | RequestOutcome::Timeout
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    /// 结果携带的状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestOutcome::Success(resp) => Some(resp.status),
            RequestOutcome::RetryableBusy { status, .. } => Some(*status),
            RequestOutcome::TerminalError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 简短描述（日志用）
    pub fn label(&self) -> String {
        match self {
            RequestOutcome::Success(resp) => format!("success({})", resp.status),
            RequestOutcome::RetryableBusy { status, .. } => format!("busy({})", status),
            RequestOutcome::TerminalError { status, .. } => format!("terminal({})", status),
            RequestOutcome::Aborted => "aborted".to_string(),
            RequestOutcome::NetworkError(msg) => format!("network({})", msg),
            RequestOutcome::Timeout => "timeout".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16) -> RequestOutcome {
        RequestOutcome::classify(HttpResponse::new(status), SuccessStatus::default())
    }

    #[test]
    fn test_classification_table() {
        assert!(classify(200).is_success());
        assert!(matches!(classify(429), RequestOutcome::RetryableBusy { status: 429, .. }));
        assert!(matches!(classify(202), RequestOutcome::RetryableBusy { status: 202, .. }));
        assert!(matches!(classify(500), RequestOutcome::RetryableBusy { .. }));
        assert!(matches!(classify(503), RequestOutcome::RetryableBusy { .. }));
        assert!(matches!(classify(404), RequestOutcome::TerminalError { status: 404, .. }));
        assert!(matches!(classify(403), RequestOutcome::TerminalError { .. }));
        // 默认只有 200 算成功
        assert!(matches!(classify(201), RequestOutcome::TerminalError { .. }));
    }

    #[test]
    fn test_any_two_hundred() {
        let ok = RequestOutcome::classify(HttpResponse::new(204), SuccessStatus::AnyTwoHundred);
        assert!(ok.is_success());
        let busy = RequestOutcome::classify(HttpResponse::new(202), SuccessStatus::AnyTwoHundred);
        assert!(busy.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let resp = HttpResponse::new(429).with_header("Retry-After", "3");
        match RequestOutcome::classify(resp, SuccessStatus::default()) {
            RequestOutcome::RetryableBusy { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(RequestOutcome::Timeout.is_retryable());
        assert!(RequestOutcome::NetworkError("dns".into()).is_retryable());
        assert!(!RequestOutcome::Aborted.is_retryable());
        assert!(!classify(400).is_retryable());
    }

    #[test]
    fn test_terminal_message_truncated() {
        let resp = HttpResponse::new(400).with_body("错".repeat(300));
        match RequestOutcome::classify(resp, SuccessStatus::default()) {
            RequestOutcome::TerminalError { message, .. } => {
                assert!(message.len() <= MAX_ERROR_MESSAGE_LEN);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
