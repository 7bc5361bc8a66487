use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The three parallel record categories that share one sync pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Transaction,
    Income,
    Expense,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Transaction,
        EntityKind::Income,
        EntityKind::Expense,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::Transaction => "transactions",
            EntityKind::Income => "incomes",
            EntityKind::Expense => "expenses",
        }
    }

    pub fn from_table(table: &str) -> Option<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.table_name() == table)
    }
}

/// A ledger row as returned by the row store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub category_ref: Option<String>,
    /// Denormalized category label. Filled in by queries only, never by writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    pub description: String,
    /// Minor currency units.
    pub amount: i64,
    pub event_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: EntityKind,
}

/// Caller-supplied fields for a new row; the session attaches the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub category_ref: Option<String>,
    pub description: String,
    pub amount: i64,
    pub event_date: NaiveDate,
}

impl RecordDraft {
    pub fn new(description: impl Into<String>, amount: i64, event_date: NaiveDate) -> Self {
        Self {
            category_ref: None,
            description: description.into(),
            amount,
            event_date,
        }
    }

    pub fn with_category(mut self, category_ref: impl Into<String>) -> Self {
        self.category_ref = Some(category_ref.into());
        self
    }

    pub fn into_new_record(self, owner_id: impl Into<String>, kind: EntityKind) -> NewRecord {
        NewRecord {
            owner_id: owner_id.into(),
            category_ref: self.category_ref,
            description: self.description,
            amount: self.amount,
            event_date: self.event_date,
            kind,
        }
    }
}

/// Insert payload sent to the row store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_ref: Option<String>,
    pub description: String,
    pub amount: i64,
    pub event_date: NaiveDate,
    pub kind: EntityKind,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<NaiveDate>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.category_ref.is_none()
            && self.description.is_none()
            && self.amount.is_none()
            && self.event_date.is_none()
    }

    pub fn apply_to(&self, record: &mut Record) {
        if let Some(category_ref) = &self.category_ref {
            if record.category_ref.as_ref() != Some(category_ref) {
                record.category_name = None;
            }
            record.category_ref = Some(category_ref.clone());
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        if let Some(amount) = self.amount {
            record.amount = amount;
        }
        if let Some(event_date) = self.event_date {
            record.event_date = event_date;
        }
    }
}

/// Equality filter on the owning-account column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub field: String,
    pub value: String,
}

impl OwnerFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self.field.as_str() {
            "owner_id" => record.owner_id == self.value,
            "id" => record.id == self.value,
            "category_ref" => record.category_ref.as_deref() == Some(self.value.as_str()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOrder {
    pub column: String,
    pub descending: bool,
}

impl QueryOrder {
    /// Display order used by every ledger list.
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".into(),
            descending: true,
        }
    }

    pub fn sort(&self, records: &mut [Record]) {
        let column = self.column.as_str();
        records.sort_by(|a, b| {
            let ordering = match column {
                "updated_at" => a.updated_at.cmp(&b.updated_at),
                "event_date" => a.event_date.cmp(&b.event_date),
                "amount" => a.amount.cmp(&b.amount),
                _ => a.created_at.cmp(&b.created_at),
            };
            if self.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
}

impl Default for QueryOrder {
    fn default() -> Self {
        Self::newest_first()
    }
}
