//! Monitoring API client
//!
//! Posts one batch per cycle to `v3/projects/<project>/timeSeries` with a
//! cached bearer token. A 401/403 refreshes the token through the configured
//! `TokenSource` and retries the same batch once.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::error::ReportError;
use crate::reporting::encoder::TimeSeriesBatch;

/// Mints bearer tokens for the monitoring API
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<String, ReportError>;
}

/// Destination of one cycle's batch
#[async_trait]
pub trait MetricsSink: Send {
    async fn report(&mut self, batch: &TimeSeriesBatch) -> Result<(), ReportError>;
}

pub struct MonitoringClient<T> {
    client: reqwest::Client,
    endpoint: String,
    token_source: T,
    token: Option<String>,
}

impl<T: TokenSource> MonitoringClient<T> {
    pub fn new(
        client: reqwest::Client,
        monitoring_url: &str,
        project_id: &str,
        token_source: T,
    ) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/v3/projects/{}/timeSeries",
                monitoring_url.trim_end_matches('/'),
                project_id
            ),
            token_source,
            token: None,
        }
    }

    /// Seed the token cache
    #[cfg(test)]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[cfg(test)]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    async fn refresh_token(&mut self) -> Result<String, ReportError> {
        let token = self.token_source.acquire().await?;
        self.token = Some(token.clone());
        info!("Access token refreshed");
        Ok(token)
    }

    async fn post(&self, body: &[u8], token: &str) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_else(|e| {
            warn!("Failed to read error response body: {}", e);
            String::new()
        });
        Err(ReportError::Rejected { status, body })
    }
}

#[async_trait]
impl<T: TokenSource> MetricsSink for MonitoringClient<T> {
    async fn report(&mut self, batch: &TimeSeriesBatch) -> Result<(), ReportError> {
        if batch.is_empty() {
            debug!("No time series this cycle, skipping report");
            return Ok(());
        }

        let body = serde_json::to_vec(batch)?;

        let (token, fresh) = match self.token.clone() {
            Some(token) => (token, false),
            None => (self.refresh_token().await?, true),
        };

        match self.post(&body, &token).await {
            Ok(()) => {}
            // a token minted this cycle is not refreshed again
            Err(e) if e.is_auth_rejection() && !fresh => {
                warn!("{}; refreshing token and retrying once", e);
                let token = self.refresh_token().await?;
                self.post(&body, &token).await?;
            }
            Err(e) => return Err(e),
        }

        debug!("Reported {} time series", batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::HostIdentity;
    use crate::metrics::{DeviceId, DeviceMetrics, DeviceReading, GpuMetric};
    use crate::reporting::encoder::encode_batch;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const PATH: &str = "/v3/projects/p1/timeSeries";

    struct CountingTokenSource {
        token: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenSource for CountingTokenSource {
        async fn acquire(&self) -> Result<String, ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token
                .map(str::to_string)
                .ok_or_else(|| ReportError::Token("gcloud not logged in".into()))
        }
    }

    fn client(
        server: &mockito::ServerGuard,
        token: Option<&'static str>,
    ) -> (MonitoringClient<CountingTokenSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingTokenSource {
            token,
            calls: calls.clone(),
        };
        let client = MonitoringClient::new(reqwest::Client::new(), &server.url(), "p1", source);
        (client, calls)
    }

    fn batch() -> TimeSeriesBatch {
        let host = HostIdentity {
            project_id: "p1".into(),
            zone: "us-central1-a".into(),
            instance_id: "123".into(),
        };
        let mut reading = DeviceReading::new();
        reading.insert(GpuMetric::Utilization, 55.0);
        let metrics = DeviceMetrics::from([(DeviceId::new("Tesla T4", "0000:00:04.0"), reading)]);
        encode_batch(&metrics, &host, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
    }

    #[test]
    fn test_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingTokenSource { token: None, calls };
        let client = MonitoringClient::new(
            reqwest::Client::new(),
            "https://monitoring.googleapis.com/",
            "my-project",
            source,
        );
        assert_eq!(
            client.endpoint(),
            "https://monitoring.googleapis.com/v3/projects/my-project/timeSeries"
        );
        assert!(client.token().is_none());
    }

    #[tokio::test]
    async fn test_report_with_cached_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("authorization", "Bearer cached")
            .match_header("content-type", "application/json; charset=utf-8")
            .match_body(Matcher::Json(serde_json::to_value(batch()).unwrap()))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let (client, calls) = client(&server, Some("unused"));
        let mut client = client.with_token("cached");
        client.report(&batch()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_report_acquires_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let (mut client, calls) = client(&server, Some("fresh"));
        client.report(&batch()).await.unwrap();
        client.report(&batch()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.token(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_stale_token_refreshed_and_retried() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("POST", PATH)
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .with_body(r#"{"error":{"code":401,"status":"UNAUTHENTICATED"}}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", PATH)
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (client, calls) = client(&server, Some("fresh"));
        let mut client = client.with_token("stale");
        client.report(&batch()).await.unwrap();

        stale.assert_async().await;
        fresh.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.token(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_retry_failure_keeps_refreshed_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let (client, calls) = client(&server, Some("fresh"));
        let mut client = client.with_token("stale");
        let err = client.report(&batch()).await.unwrap_err();

        assert!(err.is_auth_rejection());
        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.token(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_fresh_token_rejection_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let (mut client, calls) = client(&server, Some("fresh"));
        let err = client.report(&batch()).await.unwrap_err();

        assert!(err.is_auth_rejection());
        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(500)
            .with_body("backend unavailable")
            .expect(1)
            .create_async()
            .await;

        let (client, calls) = client(&server, Some("fresh"));
        let mut client = client.with_token("cached");
        let err = client.report(&batch()).await.unwrap_err();

        match err {
            ReportError::Rejected { status, body } => {
                assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "backend unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.token(), Some("cached"));
    }

    #[tokio::test]
    async fn test_token_failure_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .expect(0)
            .create_async()
            .await;

        let (mut client, calls) = client(&server, None);
        let err = client.report(&batch()).await.unwrap_err();

        assert!(matches!(err, ReportError::Token(_)));
        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.token().is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .expect(0)
            .create_async()
            .await;

        let (mut client, calls) = client(&server, Some("fresh"));
        let empty = TimeSeriesBatch {
            time_series: Vec::new(),
        };
        client.report(&empty).await.unwrap();

        mock.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
