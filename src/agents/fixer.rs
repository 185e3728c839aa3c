//! Bounded auto-repair of failing SQL: each attempt shows the model the
//! latest failing statement and latest error, so every round narrows the
//! problem instead of repeating it.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::executor::{Dialect, ExecuteSql};
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::parse::sanitize_sql;
use crate::store::{Id, MetadataStore};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct FixAttempt {
    pub attempt: u32,
    pub fixed_sql: String,
    pub error: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub fixed: bool,
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_data: Option<Vec<Value>>,
    pub db_type: String,
    pub attempts: Vec<FixAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SqlFixer<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    store: &'a dyn MetadataStore,
    task_id: Id,
    dialect: Dialect,
}

impl<'a> SqlFixer<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        options: ChatOptions,
        store: &'a dyn MetadataStore,
        task_id: Id,
        dialect: Dialect,
    ) -> Self {
        Self { chat, options, store, task_id, dialect }
    }

    /// Runs at most `max_retries` repair rounds and always terminates with
    /// `fixed: true` (carrying rows) or `fixed: false` (carrying the last SQL
    /// and error). The per-attempt log records every round.
    pub async fn fix_and_execute(
        &self,
        executor: &dyn ExecuteSql,
        question: &str,
        sql: &str,
        error_message: &str,
        selected_tables: &[String],
        max_retries: u32,
    ) -> Result<FixOutcome> {
        let mut current_sql = sql.to_string();
        let mut current_error = error_message.to_string();
        let mut attempts: Vec<FixAttempt> = Vec::new();

        let table_names = resolve_table_names(&current_sql, selected_tables);
        let table_ddls = self.table_ddls(&table_names).await?;

        for attempt in 1..=max_retries {
            let prompt = build_fix_prompt(
                self.dialect,
                &table_ddls,
                question,
                &current_sql,
                &current_error,
                attempt,
                max_retries,
            );
            let reply = self
                .chat
                .chat(
                    &[
                        ChatMessage::system("你是SQL修复专家。只返回修复后的SQL语句。"),
                        ChatMessage::user(prompt),
                    ],
                    self.options.capped(4096),
                )
                .await?;
            let fixed_sql = sanitize_sql(&reply);
            if fixed_sql.is_empty() {
                attempts.push(FixAttempt {
                    attempt,
                    fixed_sql: String::new(),
                    error: Some("AI未返回可执行SQL".to_string()),
                    reason: "ai_fix".to_string(),
                });
                continue;
            }

            match executor.execute_rows(&fixed_sql).await {
                Ok(rows) => {
                    attempts.push(FixAttempt {
                        attempt,
                        fixed_sql: fixed_sql.clone(),
                        error: None,
                        reason: "ai_fix".to_string(),
                    });
                    info!("sql fixed on attempt {}/{}", attempt, max_retries);
                    return Ok(FixOutcome {
                        fixed: true,
                        sql: fixed_sql,
                        sql_data: Some(rows),
                        db_type: self.dialect.label().to_string(),
                        attempts,
                        error: None,
                    });
                }
                Err(AppError::Executor(message)) => {
                    warn!("fix attempt {}/{} still failing: {}", attempt, max_retries, message);
                    current_sql = fixed_sql.clone();
                    current_error = message.clone();
                    attempts.push(FixAttempt {
                        attempt,
                        fixed_sql,
                        error: Some(message),
                        reason: "ai_fix".to_string(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Ok(FixOutcome {
            fixed: false,
            sql: current_sql,
            sql_data: None,
            db_type: self.dialect.label().to_string(),
            attempts,
            error: Some(current_error),
        })
    }

    async fn table_ddls(&self, table_names: &[String]) -> Result<BTreeMap<String, String>> {
        let mut ddls = BTreeMap::new();
        for table_name in table_names {
            if let Some(context) = self.store.get_table_context(self.task_id, table_name).await? {
                ddls.insert(context.table_name, context.ddl.unwrap_or_default());
            }
        }
        Ok(ddls)
    }
}

/// The caller's selected tables when it has them, otherwise the tables named
/// in the failing SQL's FROM/JOIN clauses.
pub fn resolve_table_names(sql: &str, selected_tables: &[String]) -> Vec<String> {
    if !selected_tables.is_empty() {
        return selected_tables.to_vec();
    }

    let pattern = Regex::new(r#"(?i)(?:from|join)\s+([`"\w.]+)"#).unwrap();
    let mut found: Vec<String> = Vec::new();
    for caps in pattern.captures_iter(sql) {
        let raw = caps[1].trim().trim_matches(|c| c == '`' || c == '"');
        let table = raw.rsplit('.').next().unwrap_or(raw);
        if !table.is_empty() && !found.iter().any(|t| t == table) {
            found.push(table.to_string());
        }
    }
    found
}

fn build_fix_prompt(
    dialect: Dialect,
    table_ddls: &BTreeMap<String, String>,
    question: &str,
    failed_sql: &str,
    error_message: &str,
    attempt: u32,
    max_retries: u32,
) -> String {
    let ddl_text = if table_ddls.is_empty() {
        "无可用DDL".to_string()
    } else {
        table_ddls
            .iter()
            .map(|(table_name, ddl)| format!("表: {}\nDDL:\n{}\n", table_name, ddl))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "你是{db_type} SQL修复专家。\n\
         当前是第{attempt}/{max_retries}次修复。\n\n\
         用户问题:\n{question}\n\n\
         数据库类型:\n{db_type}\n\n\
         本次涉及表DDL:\n{ddl_text}\n\n\
         失败SQL:\n{failed_sql}\n\n\
         执行报错:\n{error_message}\n\n\
         要求:\n\
         1. 只输出一个可执行SQL，不要解释，不要markdown。\n\
         2. 必须严格符合该数据库方言。\n\
         3. 尽量保持原查询意图不变，只修复报错相关问题。\n",
        db_type = dialect.label(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionEnvelope;
    use crate::store::sqlite::SqliteStore;
    use crate::testutil::{ScriptedChat, ScriptedExecutor};

    fn ok_envelope(sql: &str) -> ExecutionEnvelope {
        ExecutionEnvelope::ok(sql, vec![serde_json::json!({"n": 1})], None, 0.01)
    }

    #[test]
    fn table_names_come_from_sql_when_no_hint() {
        let sql = "SELECT * FROM public.orders o JOIN \"users\" u ON o.user_id = u.id LEFT JOIN orders x ON 1=1";
        assert_eq!(resolve_table_names(sql, &[]), vec!["orders", "users"]);

        let hint = vec!["flights".to_string()];
        assert_eq!(resolve_table_names(sql, &hint), vec!["flights"]);
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let chat = ScriptedChat::new(vec![
            "SELECT COUNT(*) FROM order",
            "SELECT COUNT(*) FROM orders",
        ]);
        let executor = ScriptedExecutor::new(vec![
            ExecutionEnvelope::failed("SELECT COUNT(*) FROM order", "relation \"order\" does not exist".to_string()),
            ok_envelope("SELECT COUNT(*) FROM orders"),
        ]);
        let fixer = SqlFixer::new(&chat, ChatOptions::new(0.1, Some(2048)), &store, 1, Dialect::Postgres);

        let outcome = fixer
            .fix_and_execute(&executor, "有多少订单？", "SELECT COUNT(*) FROM ordr", "syntax error", &[], 2)
            .await
            .unwrap();

        assert!(outcome.fixed);
        assert_eq!(outcome.sql, "SELECT COUNT(*) FROM orders");
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0].error.is_some());
        assert!(outcome.attempts[1].error.is_none());
        assert_eq!(outcome.sql_data.as_ref().unwrap().len(), 1);

        let executed = executor.executed.lock().unwrap();
        assert_eq!(executed.as_slice(), ["SELECT COUNT(*) FROM order", "SELECT COUNT(*) FROM orders"]);
    }

    #[tokio::test]
    async fn exhaustion_terminates_with_last_sql_and_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let chat = ScriptedChat::new(vec![
            "SELECT 1 FROM broken_a",
            "SELECT 1 FROM broken_b",
            "SELECT 1 FROM broken_c",
        ]);
        let executor = ScriptedExecutor::new(vec![
            ExecutionEnvelope::failed("a", "error a".to_string()),
            ExecutionEnvelope::failed("b", "error b".to_string()),
            ExecutionEnvelope::failed("c", "error c".to_string()),
        ]);
        let fixer = SqlFixer::new(&chat, ChatOptions::new(0.1, Some(2048)), &store, 1, Dialect::Postgres);

        let outcome = fixer
            .fix_and_execute(&executor, "q", "SELECT 1 FROM broken", "initial error", &[], 3)
            .await
            .unwrap();

        assert!(!outcome.fixed);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.sql, "SELECT 1 FROM broken_c");
        assert!(outcome.error.unwrap().contains("error c"));
        // Exactly max_retries LLM attempts, no unbounded looping.
        assert_eq!(chat.calls(), 3);
    }

    #[tokio::test]
    async fn empty_llm_reply_burns_the_attempt() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let chat = ScriptedChat::new(vec!["", "SELECT 2"]);
        let executor = ScriptedExecutor::new(vec![ok_envelope("SELECT 2")]);
        let fixer = SqlFixer::new(&chat, ChatOptions::new(0.1, Some(2048)), &store, 1, Dialect::Postgres);

        let outcome = fixer
            .fix_and_execute(&executor, "q", "SELECT x", "boom", &[], 2)
            .await
            .unwrap();
        assert!(outcome.fixed);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error.as_deref(), Some("AI未返回可执行SQL"));
    }

    #[tokio::test]
    async fn each_round_sees_the_latest_sql_and_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let chat = ScriptedChat::new(vec!["SELECT 1 FROM step_one", "SELECT 1 FROM step_two"]);
        let executor = ScriptedExecutor::new(vec![
            ExecutionEnvelope::failed("SELECT 1 FROM step_one", "step_one missing".to_string()),
            ok_envelope("SELECT 1 FROM step_two"),
        ]);
        let fixer = SqlFixer::new(&chat, ChatOptions::new(0.1, Some(2048)), &store, 1, Dialect::ClickHouse);

        fixer
            .fix_and_execute(&executor, "q", "SELECT 1 FROM origin", "origin error", &[], 2)
            .await
            .unwrap();

        let second_prompt = chat.prompt(1);
        assert!(second_prompt.contains("SELECT 1 FROM step_one"));
        assert!(second_prompt.contains("step_one missing"));
        assert!(!second_prompt.contains("origin error"));
    }
}
