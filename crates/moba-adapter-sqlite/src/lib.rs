//! SQLite implementation of the Moba [`Database`] interface.

use async_trait::async_trait;
use futures::TryStreamExt;
use moba_core::config::DatabaseConfig;
use moba_core::{ColumnInfo, Database, DatabaseError, QueryRows, TableInfo};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, SqlitePool, TypeInfo, ValueRef};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct SqliteOptions {
    pub read_only: bool,
    pub max_connections: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            max_connections: 5,
        }
    }
}

impl From<&DatabaseConfig> for SqliteOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            read_only: config.read_only,
            max_connections: config.max_connections,
        }
    }
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open an existing database file. The file is never created.
    pub async fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DatabaseError::Connection(format!(
                "database file not found: {}",
                path.display()
            )));
        }

        let connect = SqliteConnectOptions::new()
            .filename(path)
            .read_only(options.read_only)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        debug!(path = %path.display(), read_only = options.read_only, "Opened SQLite database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn column_names(&self, query: &str) -> Vec<String> {
        match (&self.pool).describe(query).await {
            Ok(describe) => describe
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn execute(
        &self,
        query: &str,
        params: &[Value],
        max_rows: usize,
    ) -> Result<QueryRows, DatabaseError> {
        let mut q = sqlx::query(query);
        for (i, param) in params.iter().enumerate() {
            q = match param {
                Value::Null => q.bind(None::<String>),
                Value::Bool(b) => q.bind(*b),
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => q.bind(i),
                    (None, Some(f)) => q.bind(f),
                    (None, None) => {
                        return Err(DatabaseError::Parameter {
                            position: i + 1,
                            reason: format!("number {} is out of range", n),
                        });
                    }
                },
                Value::String(s) => q.bind(s.clone()),
                Value::Array(_) | Value::Object(_) => {
                    return Err(DatabaseError::Parameter {
                        position: i + 1,
                        reason: "arrays and objects cannot be bound".to_string(),
                    });
                }
            };
        }

        let mut result = QueryRows::default();
        {
            let mut stream = q.fetch(&self.pool);
            while let Some(row) = stream
                .try_next()
                .await
                .map_err(|e| DatabaseError::Query(e.to_string()))?
            {
                if result.rows.len() == max_rows {
                    result.truncated = true;
                    break;
                }
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result.rows.push(row_to_json(&row)?);
            }
        }

        if result.columns.is_empty() {
            result.columns = self.column_names(query).await;
        }
        Ok(result)
    }

    async fn list_tables(&self) -> Result<Vec<String>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            select name from sqlite_master
            where type = 'table' and name not like 'sqlite_%'
            order by name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<TableInfo, DatabaseError> {
        let rows = sqlx::query(
            r#"select name, type, "notnull", pk from pragma_table_info(?1) order by cid"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if rows.is_empty() {
            return Err(DatabaseError::TableNotFound(table.to_string()));
        }

        let columns = rows
            .iter()
            .map(|r| ColumnInfo {
                name: r.get("name"),
                data_type: r.get("type"),
                nullable: r.get::<i64, _>("notnull") == 0,
                primary_key: r.get::<i64, _>("pk") > 0,
            })
            .collect();

        Ok(TableInfo {
            name: table.to_string(),
            columns,
        })
    }
}

/// Convert a row to a JSON object using each value's storage class.
fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>, DatabaseError> {
    let mut obj = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(i)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            decode_value(row, i, &type_name)?
        };
        obj.insert(column.name().to_string(), value);
    }
    Ok(obj)
}

fn decode_value(row: &SqliteRow, i: usize, type_name: &str) -> Result<Value, DatabaseError> {
    let err = |e: sqlx::Error| DatabaseError::Query(e.to_string());
    Ok(match type_name {
        "INTEGER" => Value::from(row.try_get::<i64, _>(i).map_err(err)?),
        "BOOLEAN" => Value::from(row.try_get::<bool, _>(i).map_err(err)?),
        "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(i).map_err(err)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(i).map_err(err)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::String(row.try_get::<String, _>(i).map_err(err)?),
    })
}
