use std::time::{Duration, Instant};

use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::debug;

use crate::executor::ExecutionEnvelope;
use crate::store::DbSettings;

/// Executes one statement against a Postgres-family backend. A fresh
/// single-connection pool per call, closed before returning; rows are
/// normalized into JSON-safe maps.
pub async fn execute(settings: &DbSettings, sql: &str) -> ExecutionEnvelope {
    let mut options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .username(&settings.username)
        .password(&settings.password)
        .database(&settings.database_name);
    if let Some(schema) = &settings.schema_name {
        if !schema.is_empty() {
            options = options.options([("search_path", schema.as_str())]);
        }
    }

    let pool = match PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
    {
        Ok(pool) => pool,
        Err(e) => return ExecutionEnvelope::failed(sql, e.to_string()),
    };

    let started = Instant::now();
    let outcome = sqlx::query(sql).fetch_all(&pool).await;
    let execution_time = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
    pool.close().await;

    match outcome {
        Ok(rows) => {
            debug!("postgres query returned {} rows in {}s", rows.len(), execution_time);
            let data = rows.iter().map(row_to_json).collect();
            ExecutionEnvelope::ok(sql, data, None, execution_time)
        }
        Err(e) => ExecutionEnvelope::failed(sql, e.to_string()),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_to_json(row, index, column.type_info().name()));
    }
    Value::Object(object)
}

/// Decodes one column into a JSON-safe value: timestamps become ISO-8601
/// strings, numerics become floats, anything undecodable degrades to a string
/// or null rather than failing the whole row.
fn column_to_json(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map_or(Value::Null, |f| Value::from(f as f64)))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::from))
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(index)
            .map(|v| {
                v.map_or(Value::Null, |decimal| {
                    let text = decimal.to_string();
                    text.parse::<f64>().map(Value::from).unwrap_or(Value::String(text))
                })
            })
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| v.map_or(Value::Null, |ts| Value::String(ts.to_rfc3339())))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| {
                v.map_or(Value::Null, |ts| {
                    Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                })
            })
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| v.map_or(Value::Null, |d| Value::String(d.to_string())))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(index)
            .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_string())))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<sqlx::types::Uuid>, _>(index)
            .map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string())))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map_or(Value::Null, Value::String))
            .unwrap_or(Value::Null),
    }
}
