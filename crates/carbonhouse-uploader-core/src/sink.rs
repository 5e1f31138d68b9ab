use async_trait::async_trait;
use carbonhouse_clickhouse::{ClickHouseClient, InsertError, InsertPayload};
use std::time::Duration;

/// Destination for tab-separated bulk inserts.
#[async_trait]
pub trait TableSink: Send + Sync {
    async fn insert_tab_separated(
        &self,
        table: &str,
        timeout: Duration,
        payload: InsertPayload,
    ) -> Result<(), InsertError>;
}

#[async_trait]
impl TableSink for ClickHouseClient {
    async fn insert_tab_separated(
        &self,
        table: &str,
        timeout: Duration,
        payload: InsertPayload,
    ) -> Result<(), InsertError> {
        ClickHouseClient::insert_tab_separated(self, table, timeout, payload).await
    }
}
