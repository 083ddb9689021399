use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use listing_common::{Config, Price, PropertyId};
use odoo_client::{nullify_false, OdooClient, OdooError, Record, DATETIME_FORMAT};

use super::{
    ActiveListing, ListingRecord, ListingUpdate, RecordStore, RelatedRecords, ScrapedFields,
    StoreError, SCRAPED_FIELD_NAMES,
};

const NOTES_FIELD: &str = "user_notes";
const TAGS_FIELD: &str = "user_tag_ids";
const SCRAPED_AT_FIELD: &str = "last_scraped_at";
const SUMMARY_FIELD: &str = "ai_summary";
const VERSION_FIELD: &str = "write_date";

/// Many2one from every child model back to the listing.
const LISTING_LINK_FIELD: &str = "property_id";

const POPULARITY_COUNTS: &[&str] = &[
    "views_total",
    "clicks_total",
    "saves_total",
    "shares_total",
    "leads_total",
];
const POPULARITY_TIMES: &[&str] = &["dwell_time_mean", "dwell_time_median"];

/// [`RecordStore`] over the Odoo JSON-2 API.
///
/// The listing model's field list is loaded once and every read and write
/// is limited to fields the model has, so optional columns such as the
/// scrape time or the summary may be missing from a deployment.
pub struct OdooStore {
    client: OdooClient,
    model: String,
    schema: OnceCell<HashSet<String>>,
}

impl OdooStore {
    pub fn new(client: OdooClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            schema: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let client = OdooClient::new(
            &config.odoo_url,
            config.odoo_api_key.clone(),
            config.odoo_db.clone(),
            config.store_timeout,
        )
        .map_err(|e| classify(e, None))?;
        Ok(Self::new(client, &config.odoo_model))
    }

    /// Field names of the listing model.
    async fn schema(&self) -> Result<&HashSet<String>, StoreError> {
        self.schema
            .get_or_try_init(|| async {
                let fields = self
                    .client
                    .fields_get(&self.model)
                    .await
                    .map_err(|e| classify(e, None))?;
                debug!(model = self.model.as_str(), count = fields.len(), "Loaded model fields");
                Ok::<_, StoreError>(fields.keys().cloned().collect())
            })
            .await
    }

    async fn read_one(&self, id: PropertyId, fields: &[&str]) -> Result<Record, StoreError> {
        let records = self
            .client
            .read(&self.model, &[id.0], fields)
            .await
            .map_err(|e| classify(e, Some(id)))?;
        records
            .into_iter()
            .next()
            .map(nullify_false)
            .ok_or(StoreError::NotFound(id))
    }

    /// Upsert every child table the listing model links to. Failures are
    /// logged; the listing write already stands.
    async fn sync_related(
        &self,
        id: PropertyId,
        related: &RelatedRecords,
        schema: &HashSet<String>,
    ) {
        for table in child_tables(related) {
            if table.rows.is_empty() {
                continue;
            }
            if !schema.contains(table.listing_field) {
                debug!(model = table.model, "Listing model has no link to child table, skipping");
                continue;
            }
            match self.sync_table(id, &table).await {
                Ok((written, created)) => debug!(
                    property_id = %id,
                    model = table.model,
                    written,
                    created,
                    "Synced related rows"
                ),
                Err(e) => warn!(
                    property_id = %id,
                    model = table.model,
                    error = %e,
                    "Failed to sync related rows"
                ),
            }
        }
    }

    /// Write rows whose key already exists under the listing, create the
    /// rest. Returns `(written, created)`.
    async fn sync_table(
        &self,
        id: PropertyId,
        table: &ChildTable,
    ) -> Result<(usize, usize), OdooError> {
        let mut fields = vec!["id"];
        fields.extend_from_slice(table.key_fields);
        let existing: HashMap<String, i64> = self
            .client
            .search_read(table.model, json!([[LISTING_LINK_FIELD, "=", id.0]]), &fields)
            .await?
            .iter()
            .filter_map(|row| {
                let child = row.get("id").and_then(Value::as_i64)?;
                Some((row_key(row, table.key_fields), child))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut written = 0;
        let mut creates = Vec::new();
        for row in &table.rows {
            let key = row_key(row, table.key_fields);
            if !seen.insert(key.clone()) {
                continue;
            }
            let mut vals = row.clone();
            vals.insert(LISTING_LINK_FIELD.to_string(), json!(id.0));
            match existing.get(&key) {
                Some(child) => {
                    self.client.write(table.model, &[*child], &vals).await?;
                    written += 1;
                }
                None => creates.push(vals),
            }
        }
        if !creates.is_empty() {
            self.client.create(table.model, &creates).await?;
        }
        Ok((written, creates.len()))
    }
}

/// Sort a client error into the pipeline's error kinds.
fn classify(err: OdooError, id: Option<PropertyId>) -> StoreError {
    match err {
        OdooError::MissingRecord(msg) => match id {
            Some(id) => StoreError::NotFound(id),
            None => StoreError::Permanent(msg),
        },
        OdooError::Network(msg) => StoreError::Transient(msg),
        OdooError::Timeout => StoreError::Transient("record store request timed out".to_string()),
        OdooError::Parse(msg) => StoreError::Transient(format!("unreadable response: {msg}")),
        OdooError::Api { status, message } if status == 429 || status >= 500 => {
            StoreError::Transient(format!("record store returned {status}: {message}"))
        }
        OdooError::Api { status, message } => {
            StoreError::Permanent(format!("record store returned {status}: {message}"))
        }
        OdooError::AccessDenied(msg) => StoreError::Permanent(format!("access denied: {msg}")),
        OdooError::Setup(msg) => StoreError::Permanent(msg),
    }
}

fn parse_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.as_str()?;
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Fields to read for a listing, limited to those the model has.
fn read_fields(schema: &HashSet<String>) -> Vec<&'static str> {
    SCRAPED_FIELD_NAMES
        .iter()
        .copied()
        .chain([NOTES_FIELD, TAGS_FIELD, SCRAPED_AT_FIELD, VERSION_FIELD])
        .filter(|name| schema.contains(*name))
        .collect()
}

fn decode(id: PropertyId, record: Record) -> Result<ListingRecord, StoreError> {
    let notes = text(record.get(NOTES_FIELD));
    let tag_ids = record
        .get(TAGS_FIELD)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    let last_scraped_at = parse_datetime(record.get(SCRAPED_AT_FIELD));
    let version = text(record.get(VERSION_FIELD));

    let fields: ScrapedFields = serde_json::from_value(Value::Object(record))
        .map_err(|e| StoreError::Permanent(format!("unexpected shape for record {id}: {e}")))?;

    Ok(ListingRecord {
        id,
        fields,
        notes,
        tag_ids,
        last_scraped_at,
        version,
    })
}

/// Values for `write`: the scraped columns the scrape filled in, the scrape
/// time and the summary when there is one, each only if the model has it.
fn encode(update: &ListingUpdate, schema: &HashSet<String>) -> Record {
    let mut vals = match serde_json::to_value(&update.fields) {
        Ok(Value::Object(map)) => map,
        _ => Record::new(),
    };
    vals.retain(|name, value| !value.is_null() && schema.contains(name));
    if schema.contains(SCRAPED_AT_FIELD) {
        vals.insert(
            SCRAPED_AT_FIELD.to_string(),
            json!(update.last_scraped_at.format(DATETIME_FORMAT).to_string()),
        );
    }
    if let Some(summary) = &update.summary {
        if schema.contains(SUMMARY_FIELD) {
            vals.insert(SUMMARY_FIELD.to_string(), json!(summary));
        }
    }
    vals
}

// --- Child tables ---

/// Rows for one child model, upserted by `key_fields` under the listing.
struct ChildTable {
    model: &'static str,
    /// One2many on the listing model that lists these rows.
    listing_field: &'static str,
    key_fields: &'static [&'static str],
    rows: Vec<Record>,
}

fn dollars(price: Option<Price>) -> Value {
    price.map_or(Value::Null, |p| json!(p.as_dollars()))
}

fn non_null(value: Value) -> Record {
    match value {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            map
        }
        _ => Record::new(),
    }
}

fn child_tables(related: &RelatedRecords) -> Vec<ChildTable> {
    let popularity = related
        .popularity
        .iter()
        .map(|window| {
            let mut row = Record::new();
            row.insert("last_n_days".into(), json!(window.last_n_days));
            for name in POPULARITY_COUNTS {
                let count = window.metrics.get(*name).map_or(0, |v| v.round() as i64);
                row.insert((*name).into(), json!(count));
            }
            for name in POPULARITY_TIMES {
                let value = window.metrics.get(*name).copied().unwrap_or(0.0);
                row.insert((*name).into(), json!(value));
            }
            row
        })
        .collect();

    let features = related
        .features
        .iter()
        .map(|group| {
            non_null(json!({
                "parent_category": group.parent_category,
                "category": group.category,
                "text_items": json!(group.items).to_string(),
            }))
        })
        .collect();

    let estimates = related
        .estimates
        .iter()
        .map(|estimate| {
            non_null(json!({
                "date": estimate.date.format("%Y-%m-%d").to_string(),
                "estimate": dollars(estimate.estimate),
                "estimate_high": dollars(estimate.high),
                "estimate_low": dollars(estimate.low),
                "is_best_home_value": estimate.best_home_value,
                "source_name": estimate.source_name,
                "source_type": estimate.source_type,
            }))
        })
        .collect();

    let tax_history = related
        .tax_history
        .iter()
        .map(|tax| {
            non_null(json!({
                "year": tax.year,
                "tax": dollars(tax.tax),
                "assessed_year": tax.assessed_year,
                "value": dollars(tax.value),
                "assessment_total": dollars(tax.assessment_total),
                "assessment_building": dollars(tax.assessment_building),
                "assessment_land": dollars(tax.assessment_land),
                "appraisal": dollars(tax.appraisal),
                "market": dollars(tax.market),
            }))
        })
        .collect();

    vec![
        ChildTable {
            model: "real_estate.popularity",
            listing_field: "popularity_ids",
            key_fields: &["last_n_days"],
            rows: popularity,
        },
        ChildTable {
            model: "real_estate.feature",
            listing_field: "feature_ids",
            key_fields: &["parent_category", "category"],
            rows: features,
        },
        ChildTable {
            model: "real_estate.estimate",
            listing_field: "estimate_ids",
            key_fields: &["date", "source_name", "source_type"],
            rows: estimates,
        },
        ChildTable {
            model: "real_estate.tax_history",
            listing_field: "tax_history_ids",
            key_fields: &["year"],
            rows: tax_history,
        },
    ]
}

/// Natural key of a child row. Odoo reads empty text back as `false`, so
/// `false`, null and missing all key as empty.
fn row_key(row: &Record, key_fields: &[&str]) -> String {
    key_fields
        .iter()
        .map(|field| match row.get(*field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|i| i.to_string())
                .unwrap_or_else(|| n.to_string()),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

#[async_trait]
impl RecordStore for OdooStore {
    async fn get(&self, id: PropertyId) -> Result<ListingRecord, StoreError> {
        let fields = read_fields(self.schema().await?);
        let record = self.read_one(id, &fields).await?;
        decode(id, record)
    }

    async fn update(&self, id: PropertyId, update: &ListingUpdate) -> Result<(), StoreError> {
        let schema = self.schema().await?;

        // JSON-2 has no conditional write; compare the version marker right
        // before writing.
        let current = self.read_one(id, &[VERSION_FIELD]).await?;
        let version = text(current.get(VERSION_FIELD));
        if version != update.expected_version {
            debug!(
                property_id = %id,
                expected = ?update.expected_version,
                found = ?version,
                "Record version moved"
            );
            return Err(StoreError::Conflict(id));
        }

        let written = self
            .client
            .write(&self.model, &[id.0], &encode(update, schema))
            .await
            .map_err(|e| classify(e, Some(id)))?;
        if !written {
            return Err(StoreError::Transient(format!("write of record {id} was not applied")));
        }

        self.sync_related(id, &update.related, schema).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .context_get()
            .await
            .map_err(|e| classify(e, None))?;

        let schema = self.schema().await?;
        let missing: Vec<&str> = SCRAPED_FIELD_NAMES
            .iter()
            .copied()
            .chain([SCRAPED_AT_FIELD, SUMMARY_FIELD])
            .filter(|name| !schema.contains(*name))
            .collect();
        if missing.is_empty() {
            info!(model = self.model.as_str(), "Listing model has every scraped field");
        } else {
            warn!(
                model = self.model.as_str(),
                missing = ?missing,
                "Listing model lacks fields, they will be neither read nor written"
            );
        }
        if !schema.contains(SCRAPED_AT_FIELD) {
            warn!("No scrape time on the listing model, stale snapshots cannot be detected");
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveListing>, StoreError> {
        let domain = json!([
            ["market_status", "!=", "off_market"],
            ["address", "!=", false]
        ]);
        let records = self
            .client
            .search_read(&self.model, domain, &["id", "address"])
            .await
            .map_err(|e| classify(e, None))?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.get("id").and_then(Value::as_i64)?;
                let address = text(record.get("address")).filter(|a| !a.trim().is_empty())?;
                Some(ActiveListing {
                    id: PropertyId(id),
                    address,
                })
            })
            .collect())
    }
}
