use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChangeNotification, ChangeOperation, Lookup};

/// Errors that can occur while normalizing an inbound change payload.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid identifier in field '{field}': {source}")]
    InvalidId {
        field: &'static str,
        source: uuid::Error,
    },
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deterministic normalizer transforming change-event JSON into
/// [`ChangeNotification`] values.
pub struct Normalizer;

impl Normalizer {
    /// Converts a raw change payload into a [`ChangeNotification`].
    ///
    /// Operation names are matched case-insensitively; unknown operations and
    /// entities are preserved so the caller can acknowledge and skip them.
    pub fn normalize(payload: &Value) -> Result<ChangeNotification, NormalizerError> {
        let data: ChangePayload = serde_json::from_value(payload.clone())?;

        let operation = data
            .operation
            .ok_or(NormalizerError::MissingField("operation"))?;
        let entity = data.entity.ok_or(NormalizerError::MissingField("entity"))?;
        let record = data.record.ok_or(NormalizerError::MissingField("record"))?;
        let record_id = record.id.ok_or(NormalizerError::MissingField("record.id"))?;
        let record_id = parse_id(&record_id, "record.id")?;

        let company_lookup = record
            .alletech_name
            .map(|lookup| {
                let id = lookup
                    .id
                    .ok_or(NormalizerError::MissingField("alletech_name.id"))?;
                Ok::<_, NormalizerError>(Lookup {
                    id: parse_id(&id, "alletech_name.id")?,
                    name: lookup.name,
                })
            })
            .transpose()?;

        Ok(ChangeNotification {
            operation: ChangeOperation::parse(&operation),
            entity,
            record_id,
            company_lookup,
        })
    }
}

fn parse_id(value: &str, field: &'static str) -> Result<Uuid, NormalizerError> {
    Uuid::parse_str(value).map_err(|source| NormalizerError::InvalidId { field, source })
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    operation: Option<String>,
    entity: Option<String>,
    record: Option<RecordPayload>,
}

#[derive(Debug, Deserialize)]
struct RecordPayload {
    id: Option<String>,
    alletech_name: Option<LookupPayload>,
}

#[derive(Debug, Deserialize)]
struct LookupPayload {
    id: Option<String>,
    name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CAF_ENTITY;
    use serde_json::json;

    fn payload(operation: &str, lookup: Value) -> Value {
        json!({
            "operation": operation,
            "entity": CAF_ENTITY,
            "record": {
                "id": "6a1e1cc0-5f0f-4f5d-9a5d-111111111111",
                "alletech_name": lookup,
            }
        })
    }

    #[test]
    fn normalizes_create_with_lookup() {
        let value = payload(
            "create",
            json!({ "id": "6a1e1cc0-5f0f-4f5d-9a5d-222222222222", "name": "Acme" }),
        );

        let notification = Normalizer::normalize(&value).expect("normalize");
        assert_eq!(notification.operation, ChangeOperation::Create);
        assert_eq!(notification.entity, CAF_ENTITY);
        assert!(notification.is_tracked());

        let lookup = notification.company_lookup.expect("lookup present");
        assert_eq!(lookup.display_name(), Some("Acme"));
    }

    #[test]
    fn operation_names_match_case_insensitively() {
        let value = payload("UPDATE", json!(null));
        let notification = Normalizer::normalize(&value).expect("normalize");
        assert_eq!(notification.operation, ChangeOperation::Update);
        assert!(notification.is_tracked());
    }

    #[test]
    fn unknown_operations_are_preserved_but_untracked() {
        let value = payload("delete", json!(null));
        let notification = Normalizer::normalize(&value).expect("normalize");
        assert_eq!(
            notification.operation,
            ChangeOperation::Other("delete".to_string())
        );
        assert!(!notification.is_tracked());
    }

    #[test]
    fn other_entities_are_untracked() {
        let value = json!({
            "operation": "create",
            "entity": "spectra_company",
            "record": { "id": "6a1e1cc0-5f0f-4f5d-9a5d-111111111111" }
        });
        let notification = Normalizer::normalize(&value).expect("normalize");
        assert!(!notification.is_tracked());
    }

    #[test]
    fn missing_lookup_normalizes_to_none() {
        let value = json!({
            "operation": "create",
            "entity": CAF_ENTITY,
            "record": { "id": "6a1e1cc0-5f0f-4f5d-9a5d-111111111111" }
        });
        let notification = Normalizer::normalize(&value).expect("normalize");
        assert_eq!(notification.company_lookup, None);
    }

    #[test]
    fn empty_lookup_name_reads_as_absent() {
        let value = payload(
            "update",
            json!({ "id": "6a1e1cc0-5f0f-4f5d-9a5d-222222222222", "name": "" }),
        );
        let notification = Normalizer::normalize(&value).expect("normalize");
        let lookup = notification.company_lookup.expect("lookup present");
        assert_eq!(lookup.display_name(), None);
    }

    #[test]
    fn missing_record_is_an_error() {
        let value = json!({ "operation": "create", "entity": CAF_ENTITY });
        let err = Normalizer::normalize(&value).expect_err("missing record");
        assert!(matches!(err, NormalizerError::MissingField("record")));
    }

    #[test]
    fn invalid_record_id_is_an_error() {
        let value = json!({
            "operation": "create",
            "entity": CAF_ENTITY,
            "record": { "id": "not-a-uuid" }
        });
        let err = Normalizer::normalize(&value).expect_err("invalid id");
        assert!(matches!(
            err,
            NormalizerError::InvalidId {
                field: "record.id",
                ..
            }
        ));
    }
}
