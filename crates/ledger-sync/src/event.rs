use ledger_store::Record;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// Identity of a deleted row; providers only guarantee the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKey {
    pub id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// A push payload, validated once at the channel boundary.
///
/// Wire shape: `{"operation": "insert" | "update" | "delete", "table": "...", "row": {...}}`.
/// Upper-case operation names are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum ChangeEvent {
    #[serde(alias = "INSERT")]
    Insert { table: String, row: Record },
    #[serde(alias = "UPDATE")]
    Update { table: String, row: Record },
    #[serde(alias = "DELETE")]
    Delete { table: String, row: RowKey },
}

impl ChangeEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn operation(&self) -> ChangeOperation {
        match self {
            ChangeEvent::Insert { .. } => ChangeOperation::Insert,
            ChangeEvent::Update { .. } => ChangeOperation::Update,
            ChangeEvent::Delete { .. } => ChangeOperation::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Update { table, .. }
            | ChangeEvent::Delete { table, .. } => table,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            ChangeEvent::Insert { row, .. } | ChangeEvent::Update { row, .. } => &row.id,
            ChangeEvent::Delete { row, .. } => &row.id,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self {
            ChangeEvent::Insert { row, .. } | ChangeEvent::Update { row, .. } => {
                Some(row.owner_id.as_str())
            }
            ChangeEvent::Delete { row, .. } => row.owner_id.as_deref(),
        }
    }

    /// True when the event belongs to `table` and does not name a different owner.
    pub fn concerns(&self, table: &str, owner_id: &str) -> bool {
        self.table() == table && self.owner_id().map_or(true, |owner| owner == owner_id)
    }
}
