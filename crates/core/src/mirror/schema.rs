//! Fixed relational schema for each collection.
//!
//! Incoming documents are schemaless; each field listed here maps to a
//! column, missing or mistyped values fall back to a neutral default, and
//! fields not listed are dropped.

use serde_json::Value;
use tokio_rusqlite::rusqlite::types::Value as SqlValue;

use crate::model::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Nullable text; non-string scalars are stored in their JSON form.
    Text,
    /// Real number defaulting to 0.
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Text }
}

const CLIENTS: &[Column] = &[
    text("name"),
    text("email"),
    text("phone"),
    text("address"),
    text("joinDate"),
    text("ownerId"),
    text("createdAt"),
];

const CASES: &[Column] = &[
    text("caseNumber"),
    text("clientName"),
    text("type"),
    Column { name: "amount", kind: ColumnKind::Real },
    text("dueDate"),
    text("description"),
    text("status"),
    text("ownerId"),
    text("createdAt"),
];

const USERS: &[Column] = &[text("email"), text("role"), text("createdAt")];

/// Data columns of the mirror table for `collection`, excluding `id`.
pub fn columns(collection: Collection) -> &'static [Column] {
    match collection {
        Collection::Clients => CLIENTS,
        Collection::Cases => CASES,
        Collection::Users => USERS,
    }
}

impl Column {
    /// SQL value for this column taken from `document`.
    ///
    /// Missing, null and empty-string text fields are stored as `NULL`.
    pub fn value_from(&self, document: &Document) -> SqlValue {
        let value = document.get(self.name).unwrap_or(&Value::Null);
        match self.kind {
            ColumnKind::Text => match value {
                Value::Null => SqlValue::Null,
                Value::String(s) if s.is_empty() => SqlValue::Null,
                Value::String(s) => SqlValue::Text(s.clone()),
                other => SqlValue::Text(other.to_string()),
            },
            ColumnKind::Real => {
                let number = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                SqlValue::Real(number.filter(|n| n.is_finite()).unwrap_or(0.0))
            }
        }
    }

    /// JSON form of a stored value.
    pub fn to_json(&self, value: SqlValue) -> Value {
        match value {
            SqlValue::Text(s) => Value::String(s),
            SqlValue::Real(n) => serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            SqlValue::Integer(i) => Value::from(i),
            SqlValue::Null | SqlValue::Blob(_) => Value::Null,
        }
    }

    /// Double-quoted identifier.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }
}
