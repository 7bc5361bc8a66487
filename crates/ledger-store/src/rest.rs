use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::{NewRecord, OwnerFilter, QueryOrder, Record, RecordPatch, RowStore, StoreError, StoreResult};

/// Row store backed by a PostgREST-style HTTP API (`/rest/v1/<table>`).
#[derive(Clone)]
pub struct RestRowStore {
    http: Client,
    base_url: Url,
    token: String,
}

impl RestRowStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> StoreResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    fn table_url(&self, table: &str) -> StoreResult<Url> {
        Ok(self.base_url.join(&format!("rest/v1/{table}"))?)
    }

    fn query_url(&self, table: &str, filter: &OwnerFilter, order: &QueryOrder) -> StoreResult<Url> {
        let mut url = self.table_url(table)?;
        let direction = if order.descending { "desc" } else { "asc" };
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair(&filter.field, &format!("eq.{}", filter.value))
            .append_pair("order", &format!("{}.{direction}", order.column));
        Ok(url)
    }

    fn row_url(&self, table: &str, id: &str) -> StoreResult<Url> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    async fn single_row(&self, table: &str, id: &str, res: Response) -> StoreResult<Record> {
        let rows: Vec<Record> = decode(res).await?;
        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> StoreResult<T> {
    let res = check_status(res).await?;
    Ok(res.json::<T>().await?)
}

async fn check_status(res: Response) -> StoreResult<Response> {
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(StoreError::UnexpectedStatus { status, body })
    }
}

#[async_trait]
impl RowStore for RestRowStore {
    async fn query(
        &self,
        table: &str,
        filter: &OwnerFilter,
        order: &QueryOrder,
    ) -> StoreResult<Vec<Record>> {
        let url = self.query_url(table, filter, order)?;
        debug!(target = "ledger_store", %url, "querying rows");
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;
        decode(res).await
    }

    async fn insert(&self, table: &str, record: NewRecord) -> StoreResult<Record> {
        let url = self.table_url(table)?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Prefer", "return=representation")
            .json(&record)
            .send()
            .await?;
        let rows: Vec<Record> = decode(res).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Store(format!("insert into {table} returned no row")))
    }

    async fn update(&self, table: &str, id: &str, patch: RecordPatch) -> StoreResult<Record> {
        let url = self.row_url(table, id)?;
        let res = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        self.single_row(table, id, res).await
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        let url = self.row_url(table, id)?;
        let res = self.http.delete(url).bearer_auth(&self.token).send().await?;
        check_status(res).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_url_carries_owner_filter_and_order() {
        let store = RestRowStore::new("https://ledger.example.com/api", "token").unwrap();
        let url = store
            .query_url(
                "incomes",
                &OwnerFilter::new("user_id", "u-42"),
                &QueryOrder::newest_first(),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://ledger.example.com/api/rest/v1/incomes?select=*&user_id=eq.u-42&order=created_at.desc"
        );
    }

    #[test]
    fn row_url_targets_single_id() {
        let store = RestRowStore::new("http://127.0.0.1:54321/", "token").unwrap();
        let url = store.row_url("expenses", "abc").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:54321/rest/v1/expenses?id=eq.abc");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            RestRowStore::new("not a url", "token"),
            Err(StoreError::Url(_))
        ));
    }
}
