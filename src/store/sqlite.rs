use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::store::{
    ChatSession, Conversation, ConversationStore, DbSettings, FieldContext, FieldProfile, Id,
    LlmSettings, MetadataStore, NewConversation, QaExample, TableContext, TableProfile,
    TableRelation, Task, TaskStatus, UserPromptConfig, WhereCondition,
};

/// Embedded application store. One logical unit of work per call; SQLite's
/// own transactional guarantees are the only locking.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        Self::with_options(options).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS llm_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                model_name TEXT NOT NULL,
                temperature REAL NOT NULL DEFAULT 0.7,
                max_tokens INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS db_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                db_type TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                database_name TEXT NOT NULL,
                schema_name TEXT
            )",
            "CREATE TABLE IF NOT EXISTS task (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                db_config_id INTEGER NOT NULL REFERENCES db_config(id) ON DELETE CASCADE,
                llm_config_id INTEGER NOT NULL REFERENCES llm_config(id) ON DELETE CASCADE,
                status INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS user_prompt_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                system_notes TEXT NOT NULL DEFAULT '[]',
                table_notes TEXT NOT NULL DEFAULT '[]',
                field_notes TEXT NOT NULL DEFAULT '[]'
            )",
            "CREATE TABLE IF NOT EXISTS table_context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                table_name TEXT NOT NULL,
                description TEXT,
                query_scenarios TEXT NOT NULL DEFAULT '[]',
                aggregation_scenarios TEXT NOT NULL DEFAULT '[]',
                data_role TEXT NOT NULL DEFAULT '[]',
                usage_not_scenarios TEXT NOT NULL DEFAULT '[]',
                ddl TEXT,
                row_count INTEGER,
                sample_rows TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS field_context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                table_id INTEGER NOT NULL REFERENCES table_context(id) ON DELETE CASCADE,
                field_name TEXT NOT NULL,
                field_type TEXT,
                business_meaning TEXT,
                data_format TEXT,
                description TEXT,
                query_scenarios TEXT NOT NULL DEFAULT '[]',
                rules TEXT NOT NULL DEFAULT '[]',
                null_rate REAL,
                unique_count INTEGER,
                sample_values TEXT
            )",
            "CREATE TABLE IF NOT EXISTS table_relation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                source_table TEXT NOT NULL,
                source_field TEXT NOT NULL,
                target_table TEXT NOT NULL,
                target_field TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                description TEXT
            )",
            "CREATE TABLE IF NOT EXISTS qa_example (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                sql TEXT NOT NULL,
                where_conditions TEXT NOT NULL DEFAULT '[]',
                tables TEXT NOT NULL DEFAULT '[]',
                is_enabled INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS chat_session (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS conversation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES chat_session(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                answer TEXT,
                description TEXT,
                is_right INTEGER,
                sql_generated TEXT,
                sql_result TEXT,
                selected_tables TEXT,
                query_context TEXT,
                column_patch TEXT,
                feedback TEXT,
                created_at TEXT NOT NULL
            )",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn string_list(row: &SqliteRow, column: &str) -> Vec<String> {
    row.try_get::<String, _>(column)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn value_list(row: &SqliteRow, column: &str) -> Vec<serde_json::Value> {
    row.try_get::<String, _>(column)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn table_context_from_row(row: &SqliteRow) -> std::result::Result<TableContext, sqlx::Error> {
    Ok(TableContext {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        table_name: row.try_get("table_name")?,
        description: row.try_get("description")?,
        query_scenarios: string_list(row, "query_scenarios"),
        aggregation_scenarios: string_list(row, "aggregation_scenarios"),
        data_role: string_list(row, "data_role"),
        usage_not_scenarios: string_list(row, "usage_not_scenarios"),
        ddl: row.try_get("ddl")?,
        row_count: row.try_get("row_count")?,
        sample_rows: value_list(row, "sample_rows"),
        is_active: row.try_get("is_active")?,
    })
}

fn session_from_row(row: &SqliteRow) -> std::result::Result<ChatSession, sqlx::Error> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> std::result::Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        task_id: row.try_get("task_id")?,
        question: row.try_get("question")?,
        answer: row.try_get("answer")?,
        description: row.try_get("description")?,
        is_right: row.try_get("is_right")?,
        sql_generated: row.try_get("sql_generated")?,
        sql_result: row.try_get("sql_result")?,
        selected_tables: row.try_get("selected_tables")?,
        query_context: row.try_get("query_context")?,
        column_patch: row.try_get("column_patch")?,
        feedback: row.try_get("feedback")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get_task(&self, task_id: Id) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM task WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| -> std::result::Result<Task, sqlx::Error> {
                Ok(Task {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    db_config_id: row.try_get("db_config_id")?,
                    llm_config_id: row.try_get("llm_config_id")?,
                    status: TaskStatus::from_code(row.try_get("status")?),
                })
            })
            .transpose()?)
    }

    async fn get_llm_settings(&self, id: Id) -> Result<Option<LlmSettings>> {
        let row = sqlx::query("SELECT * FROM llm_config WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| -> std::result::Result<LlmSettings, sqlx::Error> {
                Ok(LlmSettings {
                    id: row.try_get("id")?,
                    base_url: row.try_get("base_url")?,
                    api_key: row.try_get("api_key")?,
                    model_name: row.try_get("model_name")?,
                    temperature: row.try_get::<f64, _>("temperature")? as f32,
                    max_tokens: row.try_get::<Option<i64>, _>("max_tokens")?.map(|t| t as u32),
                    enabled: row.try_get("enabled")?,
                })
            })
            .transpose()?)
    }

    async fn get_db_settings(&self, id: Id) -> Result<Option<DbSettings>> {
        let row = sqlx::query("SELECT * FROM db_config WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| -> std::result::Result<DbSettings, sqlx::Error> {
                Ok(DbSettings {
                    id: row.try_get("id")?,
                    db_type: row.try_get("db_type")?,
                    host: row.try_get("host")?,
                    port: row.try_get::<i64, _>("port")? as u16,
                    username: row.try_get("username")?,
                    password: row.try_get("password")?,
                    database_name: row.try_get("database_name")?,
                    schema_name: row.try_get("schema_name")?,
                })
            })
            .transpose()?)
    }

    async fn get_user_prompt_config(&self, task_id: Id) -> Result<UserPromptConfig> {
        let row = sqlx::query("SELECT * FROM user_prompt_config WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| UserPromptConfig {
                system_notes: string_list(&row, "system_notes"),
                table_notes: string_list(&row, "table_notes"),
                field_notes: string_list(&row, "field_notes"),
            })
            .unwrap_or_default())
    }

    async fn list_table_contexts(&self, task_id: Id) -> Result<Vec<TableContext>> {
        let rows = sqlx::query("SELECT * FROM table_context WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(table_context_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get_table_context(&self, task_id: Id, table_name: &str) -> Result<Option<TableContext>> {
        let row = sqlx::query("SELECT * FROM table_context WHERE task_id = ? AND table_name = ?")
            .bind(task_id)
            .bind(table_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(table_context_from_row).transpose()?)
    }

    async fn list_field_contexts(&self, task_id: Id, table_id: Id) -> Result<Vec<FieldContext>> {
        let rows = sqlx::query(
            "SELECT * FROM field_context WHERE task_id = ? AND table_id = ? ORDER BY id",
        )
        .bind(task_id)
        .bind(table_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| -> std::result::Result<FieldContext, sqlx::Error> {
                Ok(FieldContext {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    table_id: row.try_get("table_id")?,
                    field_name: row.try_get("field_name")?,
                    field_type: row.try_get("field_type")?,
                    business_meaning: row.try_get("business_meaning")?,
                    data_format: row.try_get("data_format")?,
                    description: row.try_get("description")?,
                    query_scenarios: string_list(row, "query_scenarios"),
                    rules: string_list(row, "rules"),
                    null_rate: row.try_get("null_rate")?,
                    unique_count: row.try_get("unique_count")?,
                    sample_values: row.try_get("sample_values")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn list_relations(&self, task_id: Id, table_names: &[String]) -> Result<Vec<TableRelation>> {
        let rows = sqlx::query("SELECT * FROM table_relation WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        let mut relations = Vec::new();
        for row in &rows {
            let relation = TableRelation {
                source_table: row.try_get("source_table")?,
                source_field: row.try_get("source_field")?,
                target_table: row.try_get("target_table")?,
                target_field: row.try_get("target_field")?,
                relation_type: row.try_get("relation_type")?,
                description: row.try_get("description")?,
            };
            // Only relations whose both endpoints are among the selected tables.
            if table_names.contains(&relation.source_table)
                && table_names.contains(&relation.target_table)
            {
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    async fn list_enabled_qa_examples(&self, task_id: Id) -> Result<Vec<QaExample>> {
        let rows = sqlx::query("SELECT * FROM qa_example WHERE task_id = ? AND is_enabled = 1")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| -> std::result::Result<QaExample, sqlx::Error> {
                let where_raw: String = row.try_get("where_conditions")?;
                Ok(QaExample {
                    id: row.try_get("id")?,
                    task_id: row.try_get("task_id")?,
                    question: row.try_get("question")?,
                    sql: row.try_get("sql")?,
                    where_conditions: serde_json::from_str(&where_raw).unwrap_or_default(),
                    tables: string_list(row, "tables"),
                    is_enabled: row.try_get("is_enabled")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn insert_qa_example(
        &self,
        task_id: Id,
        question: &str,
        sql: &str,
        where_conditions: &[WhereCondition],
        tables: &[String],
    ) -> Result<Id> {
        let result = sqlx::query(
            "INSERT INTO qa_example (task_id, question, sql, where_conditions, tables, is_enabled)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(task_id)
        .bind(question)
        .bind(sql)
        .bind(serde_json::to_string(where_conditions).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(tables).unwrap_or_else(|_| "[]".to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_task_status(&self, task_id: Id, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE task SET status = ? WHERE id = ?")
            .bind(status.code())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_table_profile(&self, table_id: Id, profile: &TableProfile) -> Result<()> {
        sqlx::query(
            "UPDATE table_context SET description = ?, query_scenarios = ?,
             aggregation_scenarios = ?, data_role = ?, usage_not_scenarios = ?
             WHERE id = ?",
        )
        .bind(&profile.table_description)
        .bind(serde_json::to_string(&profile.query_scenarios).unwrap_or_else(|_| "[]".to_string()))
        .bind(
            serde_json::to_string(&profile.aggregation_scenarios)
                .unwrap_or_else(|_| "[]".to_string()),
        )
        .bind(serde_json::to_string(&profile.data_role).unwrap_or_else(|_| "[]".to_string()))
        .bind(
            serde_json::to_string(&profile.usage_not_scenarios)
                .unwrap_or_else(|_| "[]".to_string()),
        )
        .bind(table_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_field_profiles(
        &self,
        task_id: Id,
        table_id: Id,
        profiles: &[FieldProfile],
    ) -> Result<()> {
        for profile in profiles {
            sqlx::query(
                "UPDATE field_context SET business_meaning = ?, data_format = ?, description = ?,
                 query_scenarios = ?, rules = ?
                 WHERE task_id = ? AND table_id = ? AND field_name = ?",
            )
            .bind(&profile.business_meaning)
            .bind(&profile.data_format)
            .bind(&profile.field_description)
            .bind(
                serde_json::to_string(&profile.query_scenarios)
                    .unwrap_or_else(|_| "[]".to_string()),
            )
            .bind(serde_json::to_string(&profile.rules).unwrap_or_else(|_| "[]".to_string()))
            .bind(task_id)
            .bind(table_id)
            .bind(&profile.field_name)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn insert_relations(&self, task_id: Id, relations: &[TableRelation]) -> Result<()> {
        for relation in relations {
            sqlx::query(
                "INSERT INTO table_relation
                 (task_id, source_table, source_field, target_table, target_field, relation_type, description)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(&relation.source_table)
            .bind(&relation.source_field)
            .bind(&relation.target_table)
            .bind(&relation.target_field)
            .bind(&relation.relation_type)
            .bind(&relation.description)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_session(&self, session_id: Id) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_session WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn create_session(&self, task_id: Id, title: &str) -> Result<ChatSession> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO chat_session (task_id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(ChatSession {
            id: result.last_insert_rowid(),
            task_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn touch_session(&self, session_id: Id) -> Result<()> {
        sqlx::query("UPDATE chat_session SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_session(&self, session_id: Id, title: &str) -> Result<Option<ChatSession>> {
        sqlx::query("UPDATE chat_session SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        self.get_session(session_id).await
    }

    async fn delete_session(&self, session_id: Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_session WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_conversations(&self, session_id: Id) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM conversation WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn insert_conversation(&self, new: NewConversation) -> Result<Conversation> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO conversation
             (session_id, task_id, question, answer, description, is_right, sql_generated,
              sql_result, selected_tables, query_context, column_patch, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.session_id)
        .bind(new.task_id)
        .bind(&new.question)
        .bind(&new.answer)
        .bind(&new.description)
        .bind(new.is_right)
        .bind(&new.sql_generated)
        .bind(&new.sql_result)
        .bind(&new.selected_tables)
        .bind(&new.query_context)
        .bind(&new.column_patch)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Conversation {
            id: result.last_insert_rowid(),
            session_id: new.session_id,
            task_id: new.task_id,
            question: new.question,
            answer: new.answer,
            description: new.description,
            is_right: new.is_right,
            sql_generated: new.sql_generated,
            sql_result: new.sql_result,
            selected_tables: new.selected_tables,
            query_context: new.query_context,
            column_patch: new.column_patch,
            feedback: None,
            created_at: now,
        })
    }

    async fn get_conversation(&self, id: Id) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversation WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row).transpose()?)
    }

    async fn update_feedback(
        &self,
        id: Id,
        is_right: Option<bool>,
        description: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<Option<Conversation>> {
        if let Some(value) = is_right {
            sqlx::query("UPDATE conversation SET is_right = ? WHERE id = ?")
                .bind(value)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(value) = description {
            sqlx::query("UPDATE conversation SET description = ? WHERE id = ?")
                .bind(value)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(value) = feedback {
            sqlx::query("UPDATE conversation SET feedback = ? WHERE id = ?")
                .bind(value)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        self.get_conversation(id).await
    }
}
