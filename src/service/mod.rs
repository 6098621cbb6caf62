//! External collaborator contracts
//!
//! The core consumes two service interfaces it does not implement itself:
//!
//! - [`ExternalService`] - outbound transport for IntegrationOperator
//! - [`EntityService`] - entity creation/validation for
//!   EntityValidationOperator and entity-based hook triggers
//!
//! `http.rs` carries the reqwest-backed adapter; `mock.rs` carries the
//! in-memory doubles used throughout the test suite.

mod http;
mod mock;

pub use http::HttpService;
pub use mock::{MockEntityService, MockExternalService};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// One outbound call
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub payload: Map<String, Value>,
}

/// The adapter's answer; a 5xx status is reported here, not as an `Err`
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status_code: u16,
    pub body: Value,
}

impl ServiceResponse {
    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// Outbound transport used by IntegrationOperator. Transport failures are
/// `Err`; HTTP-level failures come back in the response.
#[async_trait]
pub trait ExternalService: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, EngineError>;
}

/// Validation verdict of a single entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Valid,
    NeedsReview,
    Invalid,
}

/// An entity created and validated by the external entity service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub owner_user_id: String,
    pub validation_status: EntityStatus,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub auto_filled_fields: Vec<String>,
    pub data: Map<String, Value>,
}

/// Entity creation + validation, supplied by an external plugin.
///
/// `entities_owned_by` backs entity-based hook triggers (does the user own
/// at least one entity of a given type).
#[async_trait]
pub trait EntityService: Send + Sync {
    async fn create_entity(
        &self,
        entity_type: &str,
        owner_user_id: &str,
        data: Map<String, Value>,
    ) -> Result<EntityRecord, EngineError>;

    /// Auto-complete then validate the given entities, returning them with
    /// `validation_status`, `validation_errors` and `auto_filled_fields`
    /// populated.
    async fn validate_entities(
        &self,
        entities: Vec<EntityRecord>,
    ) -> Result<Vec<EntityRecord>, EngineError>;

    async fn entities_owned_by(
        &self,
        owner_user_id: &str,
        entity_type: &str,
    ) -> Result<Vec<EntityRecord>, EngineError>;
}
