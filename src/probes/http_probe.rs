use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::time::Instant;
use tracing::debug;

use crate::db::models::MeasurementResult;
use crate::probes::{RunOptions, RunnerError, TestRunner};

/// Measures a target by downloading its registered URL.
///
/// `ping` is the time until response headers arrive, `download` the body
/// throughput in Mbps.
#[derive(Debug)]
pub struct HttpProbeRunner {
    client: reqwest::Client,
    endpoints: DashMap<String, String>,
}

impl HttpProbeRunner {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pulsewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoints: DashMap::new(),
        })
    }

    pub fn register(&self, target_id: impl Into<String>, url: impl Into<String>) {
        self.endpoints.insert(target_id.into(), url.into());
    }

    pub fn unregister(&self, target_id: &str) -> bool {
        self.endpoints.remove(target_id).is_some()
    }

    async fn measure(&self, target_id: &str, url: &str, options: &RunOptions) -> MeasurementResult {
        let start = Instant::now();
        let response = match self.client.get(url).timeout(options.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = if e.is_timeout() {
                    "Request timed out".to_string()
                } else {
                    format!("Request failed: {e}")
                };
                return MeasurementResult::failure(target_id, error);
            }
        };
        let ping_ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = response.status();
        if !status.is_success() {
            return MeasurementResult::failure(target_id, format!("HTTP status {status}"));
        }

        let body_start = Instant::now();
        let mut bytes_read: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => bytes_read += chunk.len() as u64,
                Err(e) => {
                    return MeasurementResult::failure(target_id, format!("Body read failed: {e}"));
                }
            }
        }
        let seconds = body_start.elapsed().as_secs_f64().max(0.001);
        let download_mbps = (bytes_read as f64 * 8.0) / seconds / 1_000_000.0;

        debug!(target_id, ping_ms, download_mbps, bytes_read, "HTTP probe finished");
        MeasurementResult::success(target_id, Some(ping_ms), Some(download_mbps))
    }
}

#[async_trait]
impl TestRunner for HttpProbeRunner {
    async fn run(
        &self,
        target_id: &str,
        options: &RunOptions,
    ) -> Result<MeasurementResult, RunnerError> {
        let url = self
            .endpoints
            .get(target_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RunnerError::UnknownTarget(target_id.to_string()))?;
        Ok(self.measure(target_id, &url, options).await)
    }
}
