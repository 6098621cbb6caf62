//! In-memory service doubles for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::{
    EntityRecord, EntityService, EntityStatus, ExternalService, ServiceRequest, ServiceResponse,
};
use crate::error::EngineError;

/// Scripted external service: answers from a queue, defaulting to 200 OK.
/// Records every request it sees.
#[derive(Default)]
pub struct MockExternalService {
    responses: Mutex<Vec<Result<ServiceResponse, EngineError>>>,
    calls: Mutex<Vec<ServiceRequest>>,
}

impl MockExternalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response (drained FIFO)
    pub fn push_response(&self, response: ServiceResponse) {
        self.responses.lock().push(Ok(response));
    }

    pub fn push_error(&self, error: EngineError) {
        self.responses.lock().push(Err(error));
    }

    pub fn push_status(&self, status_code: u16, body: Value) {
        self.push_response(ServiceResponse { status_code, body });
    }

    pub fn calls(&self) -> Vec<ServiceRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExternalService for MockExternalService {
    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, EngineError> {
        self.calls.lock().push(request);
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            Ok(ServiceResponse {
                status_code: 200,
                body: json!({"ok": true}),
            })
        } else {
            responses.remove(0)
        }
    }
}

/// Entity service double. Entities validate as `Valid` unless the type was
/// marked failing; ownership queries answer from everything created so far.
#[derive(Default)]
pub struct MockEntityService {
    created: Mutex<Vec<EntityRecord>>,
    failing_types: Mutex<Vec<String>>,
    review_types: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl MockEntityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities of this type will validate as Invalid
    pub fn fail_type(&self, entity_type: impl Into<String>) {
        self.failing_types.lock().push(entity_type.into());
    }

    /// Entities of this type will validate as NeedsReview
    pub fn review_type(&self, entity_type: impl Into<String>) {
        self.review_types.lock().push(entity_type.into());
    }

    /// Pre-seed an owned entity (for hook eligibility tests)
    pub fn seed_entity(&self, entity_type: impl Into<String>, owner: impl Into<String>) {
        let mut next = self.next_id.lock();
        *next += 1;
        self.created.lock().push(EntityRecord {
            entity_id: format!("ent-{next}", next = *next),
            entity_type: entity_type.into(),
            owner_user_id: owner.into(),
            validation_status: EntityStatus::Valid,
            validation_errors: Vec::new(),
            auto_filled_fields: Vec::new(),
            data: Map::new(),
        });
    }
}

#[async_trait]
impl EntityService for MockEntityService {
    async fn create_entity(
        &self,
        entity_type: &str,
        owner_user_id: &str,
        data: Map<String, Value>,
    ) -> Result<EntityRecord, EngineError> {
        let mut next = self.next_id.lock();
        *next += 1;
        let record = EntityRecord {
            entity_id: format!("ent-{next}", next = *next),
            entity_type: entity_type.to_string(),
            owner_user_id: owner_user_id.to_string(),
            validation_status: EntityStatus::Valid,
            validation_errors: Vec::new(),
            auto_filled_fields: Vec::new(),
            data,
        };
        self.created.lock().push(record.clone());
        Ok(record)
    }

    async fn validate_entities(
        &self,
        entities: Vec<EntityRecord>,
    ) -> Result<Vec<EntityRecord>, EngineError> {
        let failing = self.failing_types.lock().clone();
        let review = self.review_types.lock().clone();

        Ok(entities
            .into_iter()
            .map(|mut entity| {
                if failing.contains(&entity.entity_type) {
                    entity.validation_status = EntityStatus::Invalid;
                    entity
                        .validation_errors
                        .push(format!("{} failed validation", entity.entity_type));
                } else if review.contains(&entity.entity_type) {
                    entity.validation_status = EntityStatus::NeedsReview;
                    entity
                        .validation_errors
                        .push(format!("{} needs manual review", entity.entity_type));
                } else {
                    entity.validation_status = EntityStatus::Valid;
                    entity.auto_filled_fields.push("normalized".into());
                }
                entity
            })
            .collect())
    }

    async fn entities_owned_by(
        &self,
        owner_user_id: &str,
        entity_type: &str,
    ) -> Result<Vec<EntityRecord>, EngineError> {
        Ok(self
            .created
            .lock()
            .iter()
            .filter(|e| e.owner_user_id == owner_user_id && e.entity_type == entity_type)
            .cloned()
            .collect())
    }
}
