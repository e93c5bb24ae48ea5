//! Row operations on the mirror tables.

use tokio_rusqlite::rusqlite::types::Value as SqlValue;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, params_from_iter};

use super::MirrorDb;
use super::schema::{Column, ColumnKind, columns};
use crate::Error;
use crate::model::{CREATED_AT_FIELD, Collection, Document, OrderingToken, validate_id};

fn token_value(token: Option<OrderingToken>) -> SqlValue {
    token.map_or(SqlValue::Null, |t| SqlValue::Integer(t.to_sql()))
}

fn upsert_sql(collection: Collection) -> String {
    let table = collection.as_str();
    let cols = columns(collection);
    let names: Vec<String> = cols.iter().map(Column::quoted).collect();
    let placeholders: Vec<String> = (0..cols.len()).map(|i| format!("?{}", i + 2)).collect();
    let updates: Vec<String> = cols
        .iter()
        .map(|c| {
            let name = c.quoted();
            if c.name == CREATED_AT_FIELD {
                format!("{name} = COALESCE({table}.{name}, excluded.{name})")
            } else {
                format!("{name} = excluded.{name}")
            }
        })
        .collect();
    let token_param = cols.len() + 2;

    format!(
        "INSERT INTO {table} (id, {names}, sync_token, deleted) VALUES (?1, {placeholders}, ?{token_param}, 0)
         ON CONFLICT(id) DO UPDATE SET {updates},
            sync_token = COALESCE(excluded.sync_token, {table}.sync_token),
            deleted = 0
         WHERE excluded.sync_token IS NULL OR {table}.sync_token IS NULL OR {table}.sync_token < excluded.sync_token",
        names = names.join(", "),
        placeholders = placeholders.join(", "),
        updates = updates.join(", "),
    )
}

fn cleared_assignments(collection: Collection) -> String {
    columns(collection)
        .iter()
        .map(|c| match c.kind {
            ColumnKind::Text => format!("{} = NULL", c.quoted()),
            ColumnKind::Real => format!("{} = 0", c.quoted()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql(collection: Collection, filter: &str) -> String {
    let names: Vec<String> = columns(collection).iter().map(Column::quoted).collect();
    format!(
        "SELECT id, {} FROM {} WHERE deleted = 0 {filter} ORDER BY \"createdAt\" DESC, id ASC",
        names.join(", "),
        collection.as_str()
    )
}

fn row_to_document(collection: Collection, row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let mut document = Document::new();
    document.insert("id".into(), serde_json::Value::String(row.get(0)?));
    for (i, column) in columns(collection).iter().enumerate() {
        let value: SqlValue = row.get(i + 1)?;
        document.insert(column.name.into(), column.to_json(value));
    }
    Ok(document)
}

impl MirrorDb {
    /// Insert or replace the row for `id`.
    ///
    /// With a token, the write only applies when it is newer than the row's
    /// token (tombstones included). Without one it applies unconditionally
    /// and keeps the row's token. `createdAt` is kept once set.
    ///
    /// Returns whether the row changed.
    pub async fn upsert(
        &self, collection: Collection, id: &str, document: &Document, token: Option<OrderingToken>,
    ) -> Result<bool, Error> {
        validate_id(id)?;
        let mut values = Vec::with_capacity(columns(collection).len() + 2);
        values.push(SqlValue::Text(id.to_string()));
        values.extend(columns(collection).iter().map(|c| c.value_from(document)));
        values.push(token_value(token));

        let sql = upsert_sql(collection);
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let changed = conn.execute(&sql, params_from_iter(values))?;
                Ok(changed == 1)
            })
            .await
            .map_err(Error::from)
    }

    /// Tombstone the row for `id`.
    ///
    /// With a token, the tombstone is recorded even for an unknown id and
    /// only applies when newer than the row. Without one, only a live row
    /// is affected.
    ///
    /// Returns the number of rows changed.
    pub async fn delete(&self, collection: Collection, id: &str, token: Option<OrderingToken>) -> Result<u64, Error> {
        validate_id(id)?;
        let table = collection.as_str();
        let cleared = cleared_assignments(collection);
        let (sql, values) = match token {
            Some(token) => (
                format!(
                    "INSERT INTO {table} (id, sync_token, deleted) VALUES (?1, ?2, 1)
                     ON CONFLICT(id) DO UPDATE SET {cleared}, sync_token = excluded.sync_token, deleted = 1
                     WHERE {table}.sync_token IS NULL OR {table}.sync_token < excluded.sync_token"
                ),
                vec![SqlValue::Text(id.to_string()), token_value(Some(token))],
            ),
            None => (
                format!("UPDATE {table} SET {cleared}, deleted = 1 WHERE id = ?1 AND deleted = 0"),
                vec![SqlValue::Text(id.to_string())],
            ),
        };

        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let changed = conn.execute(&sql, params_from_iter(values))?;
                Ok(changed as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Live row for `id`, with `id` included as a field.
    pub async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, Error> {
        let id = id.to_string();
        let sql = select_sql(collection, "AND id = ?1");
        self.conn
            .call(move |conn| -> Result<Option<Document>, Error> {
                let document =
                    conn.query_row(&sql, [&id], |row| row_to_document(collection, row)).optional()?;
                Ok(document)
            })
            .await
            .map_err(Error::from)
    }

    /// All live rows, newest `createdAt` first.
    pub async fn list(&self, collection: Collection) -> Result<Vec<Document>, Error> {
        let sql = select_sql(collection, "");
        self.conn
            .call(move |conn| -> Result<Vec<Document>, Error> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| row_to_document(collection, row))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }

    /// Stored token for `id`, live or tombstoned.
    pub async fn sync_token(&self, collection: Collection, id: &str) -> Result<Option<OrderingToken>, Error> {
        let id = id.to_string();
        let sql = format!("SELECT sync_token FROM {} WHERE id = ?1", collection.as_str());
        self.conn
            .call(move |conn| -> Result<Option<OrderingToken>, Error> {
                let token: Option<Option<i64>> = conn.query_row(&sql, [&id], |row| row.get(0)).optional()?;
                Ok(token.flatten().map(OrderingToken::from_sql))
            })
            .await
            .map_err(Error::from)
    }
}
