//! Shared data model: collections, documents, ordering tokens and change records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A CRM document: field name to JSON value.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field holding the tenant/user that created the document.
pub const OWNER_ID_FIELD: &str = "ownerId";

/// Field holding the creation timestamp. Set once, never mutated.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// The CRM collections synchronized by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Clients,
    Cases,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Clients, Collection::Cases, Collection::Users];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Clients => "clients",
            Collection::Cases => "cases",
            Collection::Users => "users",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clients" => Ok(Collection::Clients),
            "cases" => Ok(Collection::Cases),
            "users" => Ok(Collection::Users),
            other => Err(Error::InvalidInput(format!("unknown collection: {other}"))),
        }
    }
}

/// Server-assigned, monotonically increasing write position.
///
/// `OrderingToken::ZERO` means nothing has been observed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderingToken(pub u64);

impl OrderingToken {
    pub const ZERO: OrderingToken = OrderingToken(0);

    pub fn next(self) -> Self {
        OrderingToken(self.0 + 1)
    }

    /// SQLite stores integers as i64; tokens above i64::MAX saturate.
    pub(crate) fn to_sql(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub(crate) fn from_sql(value: i64) -> Self {
        OrderingToken(u64::try_from(value).unwrap_or(0))
    }
}

impl fmt::Display for OrderingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One observed insert, update or delete.
///
/// `document` is `None` for a delete (tombstone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub collection: Collection,
    pub id: String,
    pub document: Option<Document>,
    pub token: OrderingToken,
}

impl ChangeRecord {
    pub fn upsert(collection: Collection, id: impl Into<String>, document: Document, token: OrderingToken) -> Self {
        Self { collection, id: id.into(), document: Some(document), token }
    }

    pub fn tombstone(collection: Collection, id: impl Into<String>, token: OrderingToken) -> Self {
        Self { collection, id: id.into(), document: None, token }
    }

    pub fn is_delete(&self) -> bool {
        self.document.is_none()
    }
}

/// Parse a JSON value into a document, rejecting non-objects.
pub fn document_from_value(value: serde_json::Value) -> Result<Document, Error> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!("document must be a JSON object, got {other}"))),
    }
}

pub(crate) fn validate_id(id: &str) -> Result<(), Error> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("identifier cannot be empty".into()));
    }
    Ok(())
}
