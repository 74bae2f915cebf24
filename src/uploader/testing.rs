// 测试用的脚本化传输层

use crate::uploader::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 预设响应
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Response(HttpResponse),
    Network,
    /// 永不返回（用于触发超时）
    Hang,
}

type Responder = Box<dyn Fn(&HttpRequest, usize) -> Reply + Send + Sync>;

/// 按脚本返回响应，记录所有请求
pub struct ScriptedTransport {
    /// (请求, 该 URL 的第几次调用，从 0 开始) -> 响应
    responder: Responder,
    calls: Mutex<Vec<HttpRequest>>,
    per_url: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency: Duration,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Reply + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            per_url: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn always(status: u16) -> Self {
        Self::new(move |_, _| Reply::Status(status))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.per_url.lock().get(url).copied().unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let call_no = {
            let mut per_url = self.per_url.lock();
            let n = per_url.entry(request.url.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        self.calls.lock().push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match (self.responder)(&request, call_no) {
            Reply::Status(status) => Ok(HttpResponse::new(status)),
            Reply::Response(response) => Ok(response),
            Reply::Network => Err(TransportError::Network("connection refused".to_string())),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Timeout)
            }
        }
    }
}
