//! Entity validation operator
//!
//! Applies a list of entity mappings: extract declared fields from the
//! context, create each entity via the external entity service, run
//! auto-complete and validation, and aggregate everything into one
//! `overall_status` a downstream conditional can branch on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{ExecutionContext, Operator, OperatorKind, TaskResult};
use crate::service::{EntityService, EntityStatus};

/// Aggregate verdict over all mapped entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Valid,
    HasWarnings,
    HasErrors,
    CriticalError,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Valid => "valid",
            OverallStatus::HasWarnings => "has_warnings",
            OverallStatus::HasErrors => "has_errors",
            OverallStatus::CriticalError => "critical_error",
        }
    }
}

/// One entity to create and validate
#[derive(Debug, Clone)]
pub struct EntityMapping {
    pub entity_type: String,
    /// Context keys extracted as the entity's data
    pub input_fields: Vec<String>,
    /// Key under which the per-entity result is reported
    pub output_key: String,
    /// Skip silently when none of the input fields carry data
    pub optional: bool,
}

impl EntityMapping {
    pub fn new(
        entity_type: impl Into<String>,
        input_fields: Vec<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            input_fields,
            output_key: output_key.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

pub struct EntityValidationOperator {
    entity_service: Arc<dyn EntityService>,
    mappings: Vec<EntityMapping>,
}

impl EntityValidationOperator {
    pub fn new(entity_service: Arc<dyn EntityService>, mappings: Vec<EntityMapping>) -> Self {
        Self {
            entity_service,
            mappings,
        }
    }

    fn extract_data(&self, mapping: &EntityMapping, ctx: &ExecutionContext) -> Map<String, Value> {
        let mut data = Map::new();
        for field in &mapping.input_fields {
            if let Some(value) = ctx.context.get(field) {
                data.insert(field.clone(), value.clone());
            }
        }
        data
    }
}

#[async_trait]
impl Operator for EntityValidationOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::EntityValidation
    }

    async fn execute(&self, ctx: &ExecutionContext) -> TaskResult {
        let pending: Vec<(&EntityMapping, Map<String, Value>)> = self
            .mappings
            .iter()
            .filter_map(|mapping| {
                let data = self.extract_data(mapping, ctx);
                if mapping.optional && data.values().all(Value::is_null) {
                    debug!(entity_type = %mapping.entity_type, "skipping optional entity with no data");
                    None
                } else {
                    Some((mapping, data))
                }
            })
            .collect();

        // Entities are independent; create them concurrently
        let creations = join_all(pending.into_iter().map(|(mapping, data)| async move {
            let created = self
                .entity_service
                .create_entity(&mapping.entity_type, &ctx.user_id, data)
                .await;
            (mapping, created)
        }))
        .await;

        let mut created = Vec::new();
        let mut output_keys = Vec::new();
        for (mapping, outcome) in creations {
            match outcome {
                Ok(entity) => {
                    created.push(entity);
                    output_keys.push(mapping.output_key.clone());
                }
                Err(error) => {
                    let mut data = Map::new();
                    data.insert("overall_status".into(), json!(OverallStatus::CriticalError.as_str()));
                    data.insert(
                        "validation_errors".into(),
                        json!([format!("failed to create {}: {error}", mapping.entity_type)]),
                    );
                    return TaskResult::completed(data);
                }
            }
        }

        let validated = match self.entity_service.validate_entities(created).await {
            Ok(validated) => validated,
            Err(error) => {
                let mut data = Map::new();
                data.insert("overall_status".into(), json!(OverallStatus::CriticalError.as_str()));
                data.insert("validation_errors".into(), json!([error.to_string()]));
                return TaskResult::completed(data);
            }
        };

        let mut overall = OverallStatus::Valid;
        let mut entity_results = Map::new();
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut auto_filled = Map::new();

        for (entity, output_key) in validated.iter().zip(output_keys.iter()) {
            entity_results.insert(
                output_key.clone(),
                json!({
                    "valid": entity.validation_status == EntityStatus::Valid,
                    "status": entity.validation_status,
                    "errors": entity.validation_errors,
                    "auto_filled_fields": entity.auto_filled_fields,
                    "entity_id": entity.entity_id,
                    "data": entity.data,
                }),
            );
            auto_filled.insert(output_key.clone(), json!(entity.auto_filled_fields));

            match entity.validation_status {
                EntityStatus::Valid => {}
                EntityStatus::NeedsReview => {
                    warnings.extend(entity.validation_errors.iter().map(|e| format!("{output_key}: {e}")));
                    if overall == OverallStatus::Valid {
                        overall = OverallStatus::HasWarnings;
                    }
                }
                EntityStatus::Invalid => {
                    errors.extend(entity.validation_errors.iter().map(|e| format!("{output_key}: {e}")));
                    overall = OverallStatus::HasErrors;
                }
            }
        }

        let mut data = Map::new();
        data.insert("entity_validation_completed".into(), json!(true));
        data.insert("overall_status".into(), json!(overall.as_str()));
        data.insert("entity_results".into(), Value::Object(entity_results));
        data.insert("validation_errors".into(), json!(errors));
        data.insert("validation_warnings".into(), json!(warnings));
        data.insert("auto_filled_data".into(), Value::Object(auto_filled));
        TaskResult::completed(data)
    }
}
