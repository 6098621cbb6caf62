//! HTTP-backed external-service adapter
//!
//! Shared reqwest client with connection pooling; one instance serves every
//! IntegrationOperator in the process.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ExternalService, ServiceRequest, ServiceResponse};
use crate::error::EngineError;

/// Default timeout for outbound requests (30 seconds)
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// reqwest-backed [`ExternalService`]
#[derive(Clone)]
pub struct HttpService {
    client: reqwest::Client,
}

impl HttpService {
    pub fn new() -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent("tramita/0.1")
            .build()
            .map_err(|e| EngineError::Integration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ExternalService for HttpService {
    #[instrument(skip(self, request), fields(service = %request.service_name, endpoint = %request.endpoint))]
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, EngineError> {
        debug!("dispatching integration call");

        let builder = if request.method.eq_ignore_ascii_case("GET") {
            self.client.get(&request.endpoint)
        } else if request.method.eq_ignore_ascii_case("PUT") {
            self.client.put(&request.endpoint).json(&request.payload)
        } else if request.method.eq_ignore_ascii_case("DELETE") {
            self.client.delete(&request.endpoint)
        } else {
            self.client.post(&request.endpoint).json(&request.payload)
        };

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Integration(format!("request failed: {e}")))?;

        let status_code = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Integration(format!("failed to read response: {e}")))?;

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ServiceResponse { status_code, body })
    }
}
