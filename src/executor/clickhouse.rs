use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::executor::ExecutionEnvelope;
use crate::store::DbSettings;

/// ClickHouse execution over the native HTTP interface. Each client carries a
/// random session id so temporary state stays scoped to this executor.
pub struct ClickHouseHttpClient {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    database: String,
    session_id: String,
}

#[derive(Deserialize)]
struct CompactResponse {
    meta: Vec<CompactColumn>,
    data: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct CompactColumn {
    name: String,
}

impl ClickHouseHttpClient {
    pub fn new(settings: &DbSettings) -> Result<Self> {
        let session_id = format!(
            "session_{}_{}",
            &Uuid::new_v4().simple().to_string()[..8],
            chrono::Utc::now().timestamp()
        );
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| AppError::Executor(format!("ClickHouse连接失败: {}", e)))?;

        Ok(Self {
            client,
            url: format!("http://{}:{}/", settings.host, settings.port),
            username: settings.username.clone(),
            password: settings.password.clone(),
            database: settings.database_name.clone(),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn execute(&self, sql: &str) -> ExecutionEnvelope {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("database", self.database.as_str()),
                ("session_id", self.session_id.as_str()),
                ("default_format", "JSONCompact"),
            ])
            .basic_auth(&self.username, Some(&self.password))
            .body(sql.to_string())
            .send()
            .await;
        let execution_time = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        let response = match response {
            Ok(response) => response,
            Err(e) => return self.failure(sql, e.to_string()),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return self.failure(sql, body.trim().to_string());
        }

        match parse_compact_body(&body) {
            Ok((columns, rows)) => {
                let data = zip_rows(&columns, rows);
                ExecutionEnvelope::ok(sql, data, Some(columns), execution_time)
            }
            Err(e) => self.failure(sql, e),
        }
    }

    fn failure(&self, sql: &str, error: String) -> ExecutionEnvelope {
        ExecutionEnvelope::failed(sql, format!("SQL执行错误 (session={}): {}", self.session_id, error))
    }
}

/// Parses a `JSONCompact` response body into column names and value rows.
pub fn parse_compact_body(body: &str) -> std::result::Result<(Vec<String>, Vec<Vec<Value>>), String> {
    let parsed: CompactResponse =
        serde_json::from_str(body).map_err(|e| format!("响应解析失败: {}", e))?;
    let columns = parsed.meta.into_iter().map(|column| column.name).collect();
    Ok((columns, parsed.data))
}

fn zip_rows(columns: &[String], rows: Vec<Vec<Value>>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (name, value) in columns.iter().zip(row) {
                object.insert(name.clone(), value);
            }
            Value::Object(object)
        })
        .collect()
}
