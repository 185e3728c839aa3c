pub mod clickhouse;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::parse::sanitize_sql;
use crate::store::DbSettings;

/// SQL backend family, read from the database config's type tag. Only the
/// Postgres and ClickHouse families are executable; the others exist so the
/// generation agents can emit dialect-correct syntax hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dialect {
    MySql,
    Postgres,
    Oracle,
    SqlServer,
    ClickHouse,
    Unknown,
}

impl Dialect {
    pub fn from_type_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "mysql" => Self::MySql,
            "pg" | "postgres" | "postgresql" => Self::Postgres,
            "oracle" => Self::Oracle,
            "sqlserver" | "mssql" => Self::SqlServer,
            "ck" | "clickhouse" => Self::ClickHouse,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Oracle => "Oracle",
            Self::SqlServer => "SQL Server",
            Self::ClickHouse => "ClickHouse",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub data: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    pub row_count: usize,
    pub execution_time: f64,
}

/// Uniform envelope both backends reconcile into. Execution failures are
/// captured here, never raised; the orchestration layer decides whether a
/// failure becomes an error.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEnvelope {
    pub success: bool,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub sql: String,
}

impl ExecutionEnvelope {
    pub fn ok(
        sql: &str,
        data: Vec<serde_json::Value>,
        columns: Option<Vec<String>>,
        execution_time: f64,
    ) -> Self {
        let row_count = data.len();
        Self {
            success: true,
            result: Some(ExecutionResult { data, columns, row_count, execution_time }),
            error: None,
            sql: sql.to_string(),
        }
    }

    pub fn failed(sql: &str, error: String) -> Self {
        Self { success: false, result: None, error: Some(error), sql: sql.to_string() }
    }
}

/// Polymorphic "execute SQL against the configured dialect" capability.
/// `execute_rows` is the raising wrapper the pipeline and the fixer use.
#[async_trait]
pub trait ExecuteSql: Send + Sync {
    async fn execute_envelope(&self, sql: &str) -> ExecutionEnvelope;

    async fn execute_rows(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let cleaned = sanitize_sql(sql);
        if cleaned.is_empty() {
            return Err(AppError::Executor("SQL 为空或无效".to_string()));
        }
        let envelope = self.execute_envelope(&cleaned).await;
        if !envelope.success {
            return Err(AppError::Executor(format!(
                "SQL执行错误: {}",
                envelope.error.unwrap_or_default()
            )));
        }
        Ok(envelope.result.map(|r| r.data).unwrap_or_default())
    }
}

/// Dialect-dispatching executor. Postgres connects per call; ClickHouse keeps
/// one session-scoped HTTP client for the executor's lifetime.
pub struct SqlExecutor {
    settings: DbSettings,
    dialect: Dialect,
    clickhouse: Option<clickhouse::ClickHouseHttpClient>,
}

impl SqlExecutor {
    pub fn new(settings: DbSettings) -> Result<Self> {
        let dialect = Dialect::from_type_tag(&settings.db_type);
        let clickhouse = if dialect == Dialect::ClickHouse {
            let client = clickhouse::ClickHouseHttpClient::new(&settings)?;
            tracing::debug!("clickhouse executor bound to session {}", client.session_id());
            Some(client)
        } else {
            None
        };
        Ok(Self { settings, dialect, clickhouse })
    }
}

#[async_trait]
impl ExecuteSql for SqlExecutor {
    async fn execute_envelope(&self, sql: &str) -> ExecutionEnvelope {
        match self.dialect {
            Dialect::Postgres => postgres::execute(&self.settings, sql).await,
            Dialect::ClickHouse => match &self.clickhouse {
                Some(client) => client.execute(sql).await,
                None => ExecutionEnvelope::failed(sql, "ClickHouse 客户端未初始化".to_string()),
            },
            other => ExecutionEnvelope::failed(
                sql,
                format!("不支持的数据库类型: {}", other.label()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_map_to_dialects() {
        assert_eq!(Dialect::from_type_tag("PG"), Dialect::Postgres);
        assert_eq!(Dialect::from_type_tag("postgresql"), Dialect::Postgres);
        assert_eq!(Dialect::from_type_tag("ck"), Dialect::ClickHouse);
        assert_eq!(Dialect::from_type_tag("ClickHouse"), Dialect::ClickHouse);
        assert_eq!(Dialect::from_type_tag("mysql"), Dialect::MySql);
        assert_eq!(Dialect::from_type_tag("dm8"), Dialect::Unknown);
    }

    #[tokio::test]
    async fn unsupported_dialect_yields_typed_error_not_panic() {
        let executor = SqlExecutor::new(DbSettings {
            id: 1,
            db_type: "oracle".to_string(),
            host: "localhost".to_string(),
            port: 1521,
            username: "u".to_string(),
            password: "p".to_string(),
            database_name: "d".to_string(),
            schema_name: None,
        })
        .unwrap();

        let envelope = executor.execute_envelope("SELECT 1").await;
        assert!(!envelope.success);
        assert!(envelope.error.unwrap().contains("不支持的数据库类型"));

        let error = executor.execute_rows("SELECT 1").await.unwrap_err();
        assert!(matches!(error, AppError::Executor(_)));
    }

    #[tokio::test]
    async fn execute_rows_rejects_empty_sql_before_dispatch() {
        let executor = SqlExecutor::new(DbSettings {
            id: 1,
            db_type: "pg".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            username: "u".to_string(),
            password: "p".to_string(),
            database_name: "d".to_string(),
            schema_name: None,
        })
        .unwrap();

        let error = executor.execute_rows("```sql\n;\n```").await.unwrap_err();
        assert!(error.to_string().contains("SQL 为空或无效"));
    }
}
