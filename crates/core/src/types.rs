use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Logical name of the record type whose changes drive synchronization.
pub const CAF_ENTITY: &str = "alletech_caf";
/// Logical name of the company side table.
pub const COMPANY_ENTITY: &str = "spectra_company";
/// Logical name of the group table. Groups are only ever relayed by id.
pub const GROUP_ENTITY: &str = "spectra_group";
/// Name of the sentinel company applied when no match exists.
pub const DEFAULT_COMPANY_NAME: &str = "New Company";

/// Field on the CAF record holding the company lookup (id + cached display name).
pub const FIELD_COMPANY_LOOKUP: &str = "alletech_name";
/// Resolved company reference field written back onto the CAF record.
pub const FIELD_COMPANY_REF: &str = "spectra_company";
/// Resolved group reference field written back onto the CAF record.
pub const FIELD_GROUP_REF: &str = "spectra_group";
/// Company name column used as the sole match key.
pub const FIELD_COMPANY_NAME: &str = "spectra_name";
/// Company column referencing the parent group.
pub const FIELD_COMPANY_GROUP: &str = "spectra_groupid";
/// Company column gating updates: matches without it are left untouched.
pub const FIELD_PARENT_ORG: &str = "spectra_unifyparentorgid";

/// Operation name carried by a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Other(String),
}

impl ChangeOperation {
    /// Parses an operation name case-insensitively, preserving unknown names.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "create" => Self::Create,
            "update" => Self::Update,
            _ => Self::Other(value.to_string()),
        }
    }

    /// Returns `true` for the operations that drive synchronization.
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }

    /// Canonical label used across telemetry.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Other(name) => name,
        }
    }
}

/// A lookup field value: target id plus the cached display name, which may
/// be absent or empty on freshly created records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Lookup {
    /// Returns the cached display name, treating an empty string as absent.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

/// Typed view of an inbound record-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub operation: ChangeOperation,
    pub entity: String,
    pub record_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_lookup: Option<Lookup>,
}

impl ChangeNotification {
    /// Returns `true` when the notification is a create/update of a CAF record.
    /// Everything else is acknowledged without any processing.
    pub fn is_tracked(&self) -> bool {
        self.operation.is_tracked() && self.entity == CAF_ENTITY
    }

    /// Produces a redacted JSON representation suitable for tap output.
    pub fn redacted(&self) -> Value {
        json!({
            "operation": self.operation.as_str(),
            "entity": self.entity,
            "record_id": self.record_id,
            "company_lookup": self.company_lookup.as_ref().map(|lookup| json!({
                "id": lookup.id,
                "name": lookup.name.as_ref().map(|_| "***"),
            })),
        })
    }
}

/// A company row projected from the side table for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyCandidate {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_org_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The single partial update written back onto a CAF record: the resolved
/// company reference plus, when the chosen company carries one, the group
/// reference. Fields not present here are never touched by the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferenceUpdate {
    pub record_id: Uuid,
    pub company_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
}

impl ReferenceUpdate {
    /// Returns a redacted JSON representation of the write.
    pub fn redacted(&self) -> Value {
        json!({
            "record_id": self.record_id,
            "company_id": self.company_id,
            "group_id": self.group_id,
        })
    }
}
