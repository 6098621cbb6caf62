//! Integration operator - one outbound call through the configured adapter
//!
//! Completed on 2xx-4xx (the response is data for downstream branching),
//! Failed on transport errors and 5xx. Retries belong to the executor via
//! the declared policy, never to the operator itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::debug;

use super::{ExecutionContext, Operator, OperatorKind, RetryPolicy, TaskResult};
use crate::service::{ExternalService, ServiceRequest};

pub struct IntegrationOperator {
    service: Arc<dyn ExternalService>,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    /// Context keys projected into the request payload
    pub payload_keys: Vec<String>,
    retry: Option<RetryPolicy>,
}

impl IntegrationOperator {
    pub fn new(
        service: Arc<dyn ExternalService>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            service,
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            method: "POST".into(),
            payload_keys: Vec::new(),
            retry: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn payload_keys(mut self, keys: Vec<String>) -> Self {
        self.payload_keys = keys;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[async_trait]
impl Operator for IntegrationOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Integration
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        let mut payload = Map::new();
        for key in &self.payload_keys {
            if let Some(value) = ctx.context.get(key) {
                payload.insert(key.clone(), value.clone());
            }
        }

        debug!(service = %self.service_name, endpoint = %self.endpoint, "integration call");

        let response = self
            .service
            .call(ServiceRequest {
                service_name: self.service_name.clone(),
                endpoint: self.endpoint.clone(),
                method: self.method.clone(),
                payload,
            })
            .await;

        match response {
            Ok(response) if response.is_server_error() => TaskResult::failed(format!(
                "{} answered {}",
                self.service_name, response.status_code
            )),
            Ok(response) => {
                let mut data = Map::new();
                data.insert("status_code".into(), json!(response.status_code));
                data.insert("response".into(), response.body);
                TaskResult::completed(data)
            }
            Err(error) => TaskResult::failed(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::operator::ResultStatus;
    use crate::service::MockExternalService;
    use crate::test_support::execution_context;
    use serde_json::json;

    #[tokio::test]
    async fn success_records_status_and_body() {
        let service = Arc::new(MockExternalService::new());
        service.push_status(201, json!({"registered": true}));

        let op = IntegrationOperator::new(service.clone(), "padron", "https://padron.test/v1")
            .payload_keys(vec!["citizen_id".into()]);

        let mut ctx = execution_context().await;
        ctx.context.set("citizen_id", json!("C-42"));

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.data["status_code"], 201);
        assert_eq!(result.data["response"]["registered"], true);

        let calls = service.calls();
        assert_eq!(calls[0].payload["citizen_id"], "C-42");
    }

    #[tokio::test]
    async fn server_error_fails_the_task() {
        let service = Arc::new(MockExternalService::new());
        service.push_status(503, json!({"error": "maintenance"}));

        let op = IntegrationOperator::new(service, "padron", "https://padron.test/v1");
        let ctx = execution_context().await;

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn transport_error_fails_the_task() {
        let service = Arc::new(MockExternalService::new());
        service.push_error(EngineError::Integration("connection refused".into()));

        let op = IntegrationOperator::new(service, "padron", "https://padron.test/v1");
        let ctx = execution_context().await;

        let result = op.execute(&ctx).await;
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.error.unwrap().contains("connection refused"));
    }
}
