use serde::Deserialize;

/// A record as returned by `read`/`search_read`: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Error body returned by the JSON-2 endpoint on non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    /// Fully qualified exception class, e.g. `odoo.exceptions.MissingError`.
    pub name: Option<String>,
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn is_missing_record(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.ends_with("MissingError"))
    }

    pub fn is_access_denied(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.ends_with("AccessDenied") || n.ends_with("AccessError"))
    }
}

/// Odoo sends `false` for empty non-boolean fields. Turn those into nulls so
/// typed decoding into `Option<_>` works. Only use this on records whose
/// requested fields contain no booleans.
pub fn nullify_false(record: Record) -> Record {
    record
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::Bool(false) => (k, serde_json::Value::Null),
            other => (k, other),
        })
        .collect()
}

/// Format a timestamp the way Odoo stores datetimes (UTC, no offset).
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
