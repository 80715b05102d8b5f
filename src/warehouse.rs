// 🏛️ Warehouse - append-only analytics copy of the aggregated records
//
// Rows carry a stable insert id (the record's external id) so a re-run inside
// the warehouse's dedup window does not double-count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::WarehouseSettings;
use crate::error::WarehouseError;
use crate::records::{AssetSnapshot, CanonicalRecord};
use crate::retry::{RetryError, RetryPolicy};
use crate::transform::TransformReport;

const TOTAL_ASSET_TYPE: &str = "合計（円）";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseRow {
    pub insert_id: String,
    pub json: Value,
}

/// Streaming-insert contract of the destination warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn insert_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError>;
}

// ============================================================================
// ROW MAPPING
// ============================================================================

pub fn transaction_rows(records: &[CanonicalRecord], loaded_at: DateTime<Utc>) -> Vec<WarehouseRow> {
    records
        .iter()
        .map(|canonical| {
            let r = &canonical.record;
            WarehouseRow {
                insert_id: r.external_id.clone(),
                json: json!({
                    "transaction_date": r.date.format("%Y-%m-%d").to_string(),
                    "description": r.description,
                    "category": r.major_category,
                    "sub_category": r.minor_category,
                    "amount": r.amount,
                    "institution": r.institution,
                    "memo": r.memo,
                    "is_transfer": r.is_transfer,
                    "external_id": r.external_id,
                    "adjustment_applied": canonical.adjustment_applied.join(","),
                    "created_at": loaded_at.to_rfc3339(),
                }),
            }
        })
        .collect()
}

/// One row per balance column plus the day's total.
pub fn asset_rows(snapshots: &[AssetSnapshot], loaded_at: DateTime<Utc>) -> Vec<WarehouseRow> {
    let mut rows = Vec::new();
    for snapshot in snapshots {
        let date = snapshot.date.format("%Y-%m-%d").to_string();
        let balances = std::iter::once((TOTAL_ASSET_TYPE, snapshot.total))
            .chain(snapshot.breakdown.iter().map(|(name, amount)| (name.as_str(), *amount)));

        for (asset_type, amount) in balances {
            rows.push(WarehouseRow {
                insert_id: format!("{}:{}", date, asset_type),
                json: json!({
                    "asset_date": date,
                    "asset_type": asset_type,
                    "amount": amount,
                    "created_at": loaded_at.to_rfc3339(),
                }),
            });
        }
    }
    rows
}

// ============================================================================
// LOADER
// ============================================================================

#[derive(Debug)]
pub struct TableLoad {
    pub table: String,
    pub rows: usize,
    pub result: Result<(), WarehouseError>,
}

pub struct WarehouseLoader<'a> {
    warehouse: &'a dyn Warehouse,
    settings: &'a WarehouseSettings,
    policy: RetryPolicy,
}

impl<'a> WarehouseLoader<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, settings: &'a WarehouseSettings) -> Self {
        WarehouseLoader {
            warehouse,
            settings,
            policy: settings.retry_policy(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Load both tables; a failing table does not stop the other.
    pub async fn load(&self, transformed: &TransformReport, loaded_at: DateTime<Utc>) -> Vec<TableLoad> {
        let tables = [
            (&self.settings.transactions_table, transaction_rows(&transformed.transactions, loaded_at)),
            (&self.settings.assets_table, asset_rows(&transformed.assets, loaded_at)),
        ];

        let mut loads = Vec::with_capacity(tables.len());
        for (table, rows) in tables {
            let result = self.load_table(table, &rows).await;
            match &result {
                Ok(()) => info!(table = %table, rows = rows.len(), "warehouse table loaded"),
                Err(err) => warn!(table = %table, error = %err, "warehouse load failed"),
            }
            loads.push(TableLoad {
                table: table.clone(),
                rows: rows.len(),
                result,
            });
        }
        loads
    }

    async fn load_table(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError> {
        for batch in rows.chunks(self.settings.batch_size.max(1)) {
            let label = format!("insert {}", table);
            match self
                .policy
                .run(&label, |_| self.warehouse.insert_rows(table, batch), WarehouseError::is_retryable)
                .await
            {
                Ok(()) => {}
                Err(RetryError::Aborted { error, .. }) => return Err(error),
                Err(RetryError::Exhausted { attempts, last }) => {
                    return Err(WarehouseError::Exhausted {
                        table: table.to_string(),
                        attempts,
                        last: Box::new(last),
                    })
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// BIGQUERY
// ============================================================================

pub struct BigQueryClient {
    client: reqwest::Client,
    api_base: String,
    project: String,
    dataset: String,
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    skip_invalid_rows: bool,
    rows: &'a [WarehouseRow],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertError>,
}

#[derive(Deserialize)]
struct InsertError {
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

impl BigQueryClient {
    pub fn new(settings: &WarehouseSettings, token: impl Into<String>) -> Self {
        BigQueryClient {
            client: reqwest::Client::new(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            project: settings.project.clone(),
            dataset: settings.dataset.clone(),
            token: token.into(),
        }
    }

    fn insert_url(&self, table: &str) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.api_base,
            urlencoding::encode(&self.project),
            urlencoding::encode(&self.dataset),
            urlencoding::encode(table)
        )
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn insert_rows(&self, table: &str, rows: &[WarehouseRow]) -> Result<(), WarehouseError> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = InsertAllRequest {
            skip_invalid_rows: false,
            rows,
        };
        debug!(table, rows = rows.len(), "bigquery insertAll");

        let resp = self
            .client
            .post(self.insert_url(table))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WarehouseError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: InsertAllResponse = resp.json().await?;
        rejected(table, parsed)
    }
}

fn rejected(table: &str, response: InsertAllResponse) -> Result<(), WarehouseError> {
    if response.insert_errors.is_empty() {
        return Ok(());
    }
    let reason = response
        .insert_errors
        .iter()
        .flat_map(|e| e.errors.iter().map(|p| p.message.as_str()))
        .find(|m| !m.is_empty())
        .unwrap_or("row rejected")
        .to_string();
    Err(WarehouseError::Rejected {
        table: table.to_string(),
        rejected: response.insert_errors.len(),
        reason,
    })
}

// ============================================================================
// IN-MEMORY WAREHOUSE (tests)
// ============================================================================
