use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    EntityKind, NewRecord, OwnerFilter, QueryOrder, Record, RecordPatch, RowStore, StoreError,
    StoreResult,
};

/// A call observed by [`InMemoryRowStore`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Query { table: String },
    Insert { table: String },
    Update { table: String, id: String },
    Delete { table: String, id: String },
}

#[derive(Default)]
struct FailurePlan {
    queries: u32,
    writes: u32,
}

/// In-memory adapter for tests and early wiring.
///
/// Queries resolve `category_name` from the registered categories; writes return rows
/// without it, the same way a remote join only shows up on reads.
#[derive(Default)]
pub struct InMemoryRowStore {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    categories: Mutex<HashMap<String, String>>,
    failures: Mutex<FailurePlan>,
    query_delays: Mutex<VecDeque<Duration>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl InMemoryRowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the full contents of `table`.
    pub async fn seed(&self, table: &str, rows: Vec<Record>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn register_category(&self, id: impl Into<String>, name: impl Into<String>) {
        self.categories.lock().await.insert(id.into(), name.into());
    }

    /// The next `count` queries fail with a store error.
    pub async fn fail_next_queries(&self, count: u32) {
        self.failures.lock().await.queries = count;
    }

    /// The next `count` writes (insert, update or delete) fail with a store error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.failures.lock().await.writes = count;
    }

    /// Delays the next query by `delay`. Rows are read before the delay elapses.
    pub async fn delay_next_query(&self, delay: Duration) {
        self.query_delays.lock().await.push_back(delay);
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().await.clone()
    }

    pub async fn query_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| matches!(call, StoreCall::Query { .. }))
            .count()
    }

    async fn record_call(&self, call: StoreCall) {
        self.calls.lock().await.push(call);
    }

    async fn take_query_failure(&self) -> bool {
        let mut plan = self.failures.lock().await;
        if plan.queries > 0 {
            plan.queries -= 1;
            true
        } else {
            false
        }
    }

    async fn take_write_failure(&self) -> bool {
        let mut plan = self.failures.lock().await;
        if plan.writes > 0 {
            plan.writes -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn query(
        &self,
        table: &str,
        filter: &OwnerFilter,
        order: &QueryOrder,
    ) -> StoreResult<Vec<Record>> {
        self.record_call(StoreCall::Query {
            table: table.to_string(),
        })
        .await;
        if self.take_query_failure().await {
            return Err(StoreError::Store(format!("injected query failure on {table}")));
        }

        let mut rows: Vec<Record> = {
            let tables = self.tables.lock().await;
            tables
                .get(table)
                .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
                .unwrap_or_default()
        };
        {
            let categories = self.categories.lock().await;
            for row in rows.iter_mut() {
                row.category_name = row
                    .category_ref
                    .as_ref()
                    .and_then(|id| categories.get(id).cloned());
            }
        }
        order.sort(&mut rows);

        let delay = self.query_delays.lock().await.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: NewRecord) -> StoreResult<Record> {
        self.record_call(StoreCall::Insert {
            table: table.to_string(),
        })
        .await;
        if self.take_write_failure().await {
            return Err(StoreError::Store(format!("injected insert failure on {table}")));
        }
        let kind = EntityKind::from_table(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let now = Utc::now();
        let row = Record {
            id: Uuid::new_v4().to_string(),
            owner_id: record.owner_id,
            category_ref: record.category_ref,
            category_name: None,
            description: record.description,
            amount: record.amount,
            event_date: record.event_date,
            created_at: now,
            updated_at: now,
            kind,
        };
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: RecordPatch) -> StoreResult<Record> {
        self.record_call(StoreCall::Update {
            table: table.to_string(),
            id: id.to_string(),
        })
        .await;
        if self.take_write_failure().await {
            return Err(StoreError::Store(format!("injected update failure on {table}")));
        }

        let mut tables = self.tables.lock().await;
        let existing = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        patch.apply_to(existing);
        existing.updated_at = Utc::now();
        let mut returned = existing.clone();
        returned.category_name = None;
        Ok(returned)
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        self.record_call(StoreCall::Delete {
            table: table.to_string(),
            id: id.to_string(),
        })
        .await;
        if self.take_write_failure().await {
            return Err(StoreError::Store(format!("injected delete failure on {table}")));
        }
        if let Some(rows) = self.tables.lock().await.get_mut(table) {
            rows.retain(|r| r.id != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordDraft;
    use chrono::NaiveDate;

    fn draft(description: &str) -> NewRecord {
        RecordDraft::new(description, 500, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            .with_category("cat-food")
            .into_new_record("owner-1", EntityKind::Expense)
    }

    #[tokio::test]
    async fn insert_then_query_resolves_category_names() {
        let store = InMemoryRowStore::new();
        store.register_category("cat-food", "Groceries").await;

        let inserted = store.insert("expenses", draft("bread")).await.unwrap();
        assert_eq!(inserted.kind, EntityKind::Expense);
        assert_eq!(inserted.category_name, None);

        let rows = store
            .query(
                "expenses",
                &OwnerFilter::new("owner_id", "owner-1"),
                &QueryOrder::newest_first(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category_name.as_deref(), Some("Groceries"));
    }

    #[tokio::test]
    async fn query_filters_by_owner() {
        let store = InMemoryRowStore::new();
        store.insert("expenses", draft("mine")).await.unwrap();
        let mut other = draft("theirs");
        other.owner_id = "owner-2".into();
        store.insert("expenses", other).await.unwrap();

        let rows = store
            .query(
                "expenses",
                &OwnerFilter::new("owner_id", "owner-2"),
                &QueryOrder::newest_first(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "theirs");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryRowStore::new();
        store.fail_next_writes(1).await;
        assert!(store.insert("expenses", draft("a")).await.is_err());
        assert!(store.insert("expenses", draft("b")).await.is_ok());
        assert_eq!(store.rows("expenses").await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_table_rejects_insert() {
        let store = InMemoryRowStore::new();
        let err = store.insert("debts", draft("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(ref t) if t == "debts"));
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found_and_delete_missing_is_ok() {
        let store = InMemoryRowStore::new();
        let err = store
            .update("expenses", "nope", RecordPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        store.delete("expenses", "nope").await.unwrap();
        assert_eq!(
            store.calls().await.last(),
            Some(&StoreCall::Delete {
                table: "expenses".into(),
                id: "nope".into()
            })
        );
    }
}
