//! Top-level conversational flow: one incoming question runs the whole chain
//! (matcher → selector → context → patch → generate → execute → fix)
//! sequentially, persists the turn, and returns the full trace.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::agents::context::{QueryContext, QueryContextBuilder};
use crate::agents::fixer::{FixOutcome, SqlFixer, DEFAULT_MAX_RETRIES};
use crate::agents::generator::{GeneratedSql, SqlGenerator};
use crate::agents::matcher::{extract_where_and_tables, SimilarityMatcher};
use crate::agents::patcher::{ColumnPatcher, PatchOutcome};
use crate::agents::selector::{SelectionOutcome, TableSelector};
use crate::error::{AppError, Result};
use crate::executor::{Dialect, ExecuteSql, SqlExecutor};
use crate::llm::client::OpenAiChatClient;
use crate::llm::ChatApi;
use crate::store::{
    ChatSession, Conversation, ConversationStore, DbSettings, Id, LlmSettings, MetadataStore,
    NewConversation,
};

/// Similarity above which a matched example is executed directly, skipping
/// table selection.
pub const SIMILARITY_THRESHOLD: u8 = 90;

const SESSION_TITLE_CHARS: usize = 24;

pub type ChatFactory = Box<dyn Fn(&LlmSettings) -> Result<Arc<dyn ChatApi>> + Send + Sync>;
pub type ExecutorFactory = Box<dyn Fn(&DbSettings) -> Result<Arc<dyn ExecuteSql>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub task_id: Id,
    pub question: String,
    pub session_id: Option<Id>,
    pub session_title: Option<String>,
    pub description: Option<String>,
    pub is_right: Option<bool>,
}

impl AskRequest {
    pub fn new(task_id: Id, question: impl Into<String>) -> Self {
        Self {
            task_id,
            question: question.into(),
            session_id: None,
            session_title: None,
            description: None,
            is_right: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Id,
    pub task_id: Id,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub conversation_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub id: Id,
    pub session_id: Id,
    pub task_id: Id,
    pub question: String,
    pub answer: Option<String>,
    pub description: Option<String>,
    pub is_right: Option<bool>,
    pub sql_generated: Option<String>,
    pub sql_result: Option<String>,
    pub sql_data: Option<Value>,
    pub selected_tables: Option<Value>,
    pub query_context: Option<Value>,
    pub column_patch: Option<Value>,
    pub feedback: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ConversationView {
    fn from_row(row: Conversation, sql_data: Option<Value>) -> Self {
        let parse_blob = |raw: &Option<String>| -> Option<Value> {
            raw.as_deref().filter(|s| !s.is_empty()).map(|s| {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
            })
        };
        let sql_data = sql_data.or_else(|| parse_blob(&row.sql_result));
        Self {
            id: row.id,
            session_id: row.session_id,
            task_id: row.task_id,
            question: row.question,
            answer: row.answer,
            description: row.description,
            is_right: row.is_right,
            sql_generated: row.sql_generated,
            sql_result: row.sql_result,
            sql_data,
            selected_tables: parse_blob(&row.selected_tables),
            query_context: parse_blob(&row.query_context),
            column_patch: parse_blob(&row.column_patch),
            feedback: row.feedback,
            created_at: row.created_at,
        }
    }
}

/// Full trace of one `ask` call, every intermediate artifact included for
/// observability.
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub session: SessionView,
    pub conversation: ConversationView,
    pub select_table_result: Option<SelectionOutcome>,
    pub query_context: Option<QueryContext>,
    pub column_patch: Option<PatchOutcome>,
    pub create_sql_result: Option<GeneratedSql>,
    pub sql_fix_result: Option<FixOutcome>,
}

pub struct ChatOrchestrator {
    meta: Arc<dyn MetadataStore>,
    conversations: Arc<dyn ConversationStore>,
    chat_factory: ChatFactory,
    executor_factory: ExecutorFactory,
}

impl ChatOrchestrator {
    pub fn new(meta: Arc<dyn MetadataStore>, conversations: Arc<dyn ConversationStore>) -> Self {
        Self::with_factories(
            meta,
            conversations,
            Box::new(|settings| Ok(Arc::new(OpenAiChatClient::new(settings)?) as Arc<dyn ChatApi>)),
            Box::new(|settings| {
                Ok(Arc::new(SqlExecutor::new(settings.clone())?) as Arc<dyn ExecuteSql>)
            }),
        )
    }

    pub fn with_factories(
        meta: Arc<dyn MetadataStore>,
        conversations: Arc<dyn ConversationStore>,
        chat_factory: ChatFactory,
        executor_factory: ExecutorFactory,
    ) -> Self {
        Self { meta, conversations, chat_factory, executor_factory }
    }

    /// Answers one question. Returns the full trace on success; after fixer
    /// exhaustion the conversation row is persisted first and the execution
    /// error is then raised to the caller.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        let task = self
            .meta
            .get_task(request.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("任务ID {}", request.task_id)))?;
        let llm = self
            .meta
            .get_llm_settings(task.llm_config_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("LLM配置ID {}", task.llm_config_id)))?;
        if !llm.enabled {
            return Err(AppError::Disabled(format!("LLM配置ID {}", llm.id)));
        }
        let db = self
            .meta
            .get_db_settings(task.db_config_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("数据库配置ID {}", task.db_config_id)))?;

        let session = self
            .get_or_create_session(
                request.task_id,
                request.session_id,
                request.session_title.as_deref(),
                &request.question,
            )
            .await?;

        let chat = (self.chat_factory)(&llm)?;
        let executor = (self.executor_factory)(&db)?;
        let dialect = Dialect::from_type_tag(&db.db_type);

        let examples = self.meta.list_enabled_qa_examples(request.task_id).await?;
        let mut matcher = SimilarityMatcher::new(chat.as_ref(), llm.chat_options());
        let matched = matcher.match_sql(&request.question, &examples).await?;

        let mut sql_generated = matched.sql.clone();
        let mut sql_data: Option<Vec<Value>> = None;
        let mut select_table_result: Option<SelectionOutcome> = None;
        let mut query_context: Option<QueryContext> = None;
        let mut column_patch: Option<PatchOutcome> = None;
        let mut create_sql_result: Option<GeneratedSql> = None;
        let mut sql_fix_result: Option<FixOutcome> = None;
        let mut execution_failure: Option<String> = None;

        let answer;
        if !sql_generated.is_empty() && matched.similarity > SIMILARITY_THRESHOLD {
            info!("similarity {} > {}: executing matched SQL directly", matched.similarity, SIMILARITY_THRESHOLD);
            let (data, final_sql, fix, failure) = self
                .execute_with_auto_fix(
                    chat.as_ref(),
                    executor.as_ref(),
                    &llm,
                    request.task_id,
                    dialect,
                    &request.question,
                    &sql_generated,
                    &[],
                )
                .await?;
            sql_data = data;
            sql_generated = final_sql;
            sql_fix_result = fix;
            execution_failure = failure;
            answer = "已匹配到高相似度问答对并执行SQL。".to_string();
        } else {
            let selector = TableSelector::new(chat.as_ref(), llm.chat_options());
            let catalog = self.meta.list_table_contexts(request.task_id).await?;
            let selection = selector.select(&request.question, &catalog).await?;
            let table_names: Vec<String> =
                selection.selected_tables.iter().map(|t| t.table_name.clone()).collect();
            select_table_result = Some(selection);

            if !table_names.is_empty() {
                let builder = QueryContextBuilder::new(
                    chat.as_ref(),
                    llm.chat_options(),
                    self.meta.as_ref(),
                    request.task_id,
                );
                let context = builder.build(&request.question, &table_names).await?;
                if !context.is_empty() {
                    let patcher = ColumnPatcher::new(
                        chat.as_ref(),
                        llm.chat_options(),
                        self.meta.as_ref(),
                        request.task_id,
                        dialect,
                    );
                    let patches = patcher.patch(&request.question, &context, &table_names).await?;

                    let generator = SqlGenerator::new(
                        chat.as_ref(),
                        llm.chat_options(),
                        self.meta.as_ref(),
                        request.task_id,
                        dialect,
                    );
                    let generated =
                        generator.generate(&request.question, &context, &patches, &table_names).await?;
                    let candidate_sql = generated.sql.trim().to_string();

                    column_patch = Some(patches);
                    create_sql_result = Some(generated);

                    if !candidate_sql.is_empty() {
                        let (data, final_sql, fix, failure) = self
                            .execute_with_auto_fix(
                                chat.as_ref(),
                                executor.as_ref(),
                                &llm,
                                request.task_id,
                                dialect,
                                &request.question,
                                &candidate_sql,
                                &table_names,
                            )
                            .await?;
                        sql_data = data;
                        sql_generated = final_sql;
                        sql_fix_result = fix;
                        execution_failure = failure;
                    }
                }
                query_context = Some(context);
            }
            answer = "相似度低于阈值，已触发选表代理。".to_string();
        }

        let selected_tables_blob = select_table_result
            .as_ref()
            .filter(|s| !s.selected_tables.is_empty())
            .and_then(|s| serde_json::to_string(&s.selected_tables).ok());
        let conversation = self
            .conversations
            .insert_conversation(NewConversation {
                session_id: session.id,
                task_id: request.task_id,
                question: request.question.clone(),
                answer: Some(answer),
                description: request.description.clone(),
                is_right: request.is_right,
                sql_generated: if sql_generated.is_empty() { None } else { Some(sql_generated) },
                sql_result: sql_data.as_ref().and_then(|d| serde_json::to_string(d).ok()),
                selected_tables: selected_tables_blob,
                query_context: query_context.as_ref().and_then(|c| serde_json::to_string(c).ok()),
                column_patch: column_patch.as_ref().and_then(|p| serde_json::to_string(p).ok()),
            })
            .await?;
        self.conversations.touch_session(session.id).await?;

        if let Some(failure) = execution_failure {
            return Err(AppError::Executor(failure));
        }

        let session_view = self.session_view(session).await?;
        Ok(AskResponse {
            session: session_view,
            conversation: ConversationView::from_row(
                conversation,
                sql_data.map(Value::Array),
            ),
            select_table_result,
            query_context,
            column_patch,
            create_sql_result,
            sql_fix_result,
        })
    }

    /// Executes, escalating a failure into the bounded fixer. A fixed run
    /// returns its rows; an exhausted one returns the last SQL plus the error
    /// to raise after the turn is persisted.
    #[allow(clippy::too_many_arguments)]
    async fn execute_with_auto_fix(
        &self,
        chat: &dyn ChatApi,
        executor: &dyn ExecuteSql,
        llm: &LlmSettings,
        task_id: Id,
        dialect: Dialect,
        question: &str,
        sql: &str,
        selected_tables: &[String],
    ) -> Result<(Option<Vec<Value>>, String, Option<FixOutcome>, Option<String>)> {
        match executor.execute_rows(sql).await {
            Ok(rows) => Ok((Some(rows), sql.to_string(), None, None)),
            Err(AppError::Executor(message)) => {
                warn!(
                    "sql execute failed, trying auto-fix task_id={} tables={} error={}",
                    task_id,
                    selected_tables.join(","),
                    message
                );
                let fixer =
                    SqlFixer::new(chat, llm.chat_options(), self.meta.as_ref(), task_id, dialect);
                let outcome = fixer
                    .fix_and_execute(
                        executor,
                        question,
                        sql,
                        &message,
                        selected_tables,
                        DEFAULT_MAX_RETRIES,
                    )
                    .await?;
                if outcome.fixed {
                    let rows = outcome.sql_data.clone();
                    let final_sql = outcome.sql.clone();
                    Ok((rows, final_sql, Some(outcome), None))
                } else {
                    let error = outcome.error.clone().unwrap_or(message);
                    let final_sql = outcome.sql.clone();
                    Ok((None, final_sql, Some(outcome), Some(error)))
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn get_or_create_session(
        &self,
        task_id: Id,
        session_id: Option<Id>,
        session_title: Option<&str>,
        question: &str,
    ) -> Result<ChatSession> {
        if let Some(session_id) = session_id {
            let session = self
                .conversations
                .get_session(session_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("会话ID {}", session_id)))?;
            if session.task_id != task_id {
                return Err(AppError::Invalid("会话与任务ID不匹配".to_string()));
            }
            return Ok(session);
        }

        let title = match session_title {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => {
                if question.chars().count() > SESSION_TITLE_CHARS {
                    let head: String = question.chars().take(SESSION_TITLE_CHARS).collect();
                    format!("{}...", head)
                } else {
                    question.to_string()
                }
            }
        };
        self.conversations.create_session(task_id, &title).await
    }

    async fn session_view(&self, session: ChatSession) -> Result<SessionView> {
        // Re-read so updated_at reflects the touch above.
        let fresh = self.conversations.get_session(session.id).await?.unwrap_or(session);
        let conversation_count = self.conversations.count_conversations(fresh.id).await?;
        Ok(SessionView {
            id: fresh.id,
            task_id: fresh.task_id,
            title: fresh.title,
            created_at: fresh.created_at,
            updated_at: fresh.updated_at,
            conversation_count,
        })
    }

    pub async fn create_session(&self, task_id: Id, title: Option<&str>) -> Result<SessionView> {
        self.meta
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("任务ID {}", task_id)))?;
        let title = title
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("会话-{}", task_id));
        let session = self.conversations.create_session(task_id, &title).await?;
        self.session_view(session).await
    }

    pub async fn get_session(&self, session_id: Id) -> Result<SessionView> {
        let session = self
            .conversations
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("会话ID {}", session_id)))?;
        self.session_view(session).await
    }

    pub async fn rename_session(&self, session_id: Id, title: &str) -> Result<SessionView> {
        let session = self
            .conversations
            .rename_session(session_id, title)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("会话ID {}", session_id)))?;
        self.session_view(session).await
    }

    pub async fn delete_session(&self, session_id: Id) -> Result<()> {
        if !self.conversations.delete_session(session_id).await? {
            return Err(AppError::NotFound(format!("会话ID {}", session_id)));
        }
        Ok(())
    }

    /// Updates the feedback trio on an existing conversation; everything else
    /// on the row stays immutable.
    pub async fn update_conversation_feedback(
        &self,
        conversation_id: Id,
        is_right: Option<bool>,
        description: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<ConversationView> {
        let row = self
            .conversations
            .update_feedback(conversation_id, is_right, description, feedback)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("对话ID {}", conversation_id)))?;
        Ok(ConversationView::from_row(row, None))
    }

    /// Turns a confirmed conversation into a reusable few-shot example:
    /// extracts its WHERE conditions and tables, then stores an enabled
    /// QaExample.
    pub async fn harvest_qa_example(&self, conversation_id: Id) -> Result<Id> {
        let row = self
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("对话ID {}", conversation_id)))?;
        let sql = row
            .sql_generated
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Invalid("对话没有可用的SQL".to_string()))?;

        let task = self
            .meta
            .get_task(row.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("任务ID {}", row.task_id)))?;
        let llm = self
            .meta
            .get_llm_settings(task.llm_config_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("LLM配置ID {}", task.llm_config_id)))?;
        let chat = (self.chat_factory)(&llm)?;

        let (where_conditions, tables) =
            extract_where_and_tables(chat.as_ref(), llm.chat_options(), &row.question, sql).await?;
        self.meta
            .insert_qa_example(row.task_id, &row.question, sql, &where_conditions, &tables)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionEnvelope;
    use crate::store::sqlite::SqliteStore;
    use crate::testutil::{ScriptedChat, ScriptedExecutor};

    const MATCH_95: &str = "【相似度】\n95\n\n【SQL】\nSELECT COUNT(*) FROM orders WHERE day_key = '2025-12-05'\n\n【匹配说明】\n选择了示例1，相似度95%。";
    const MATCH_50: &str = "【相似度】\n50\n\n【SQL】\nSELECT 1\n\n【匹配说明】\n仅部分相似。";

    async fn seed_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        sqlx::query(
            "INSERT INTO llm_config (base_url, api_key, model_name, temperature, max_tokens, enabled)
             VALUES ('http://localhost/v1', 'k', 'm', 0.2, 4096, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO db_config (db_type, host, port, username, password, database_name)
             VALUES ('pg', 'localhost', 5432, 'u', 'p', 'demo')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO task (name, db_config_id, llm_config_id, status) VALUES ('demo', 1, 1, 5)")
            .execute(store.pool())
            .await
            .unwrap();
        store
    }

    async fn seed_catalog(store: &SqliteStore) {
        sqlx::query(
            "INSERT INTO table_context (task_id, table_name, description, ddl, row_count)
             VALUES (1, 'orders', '订单事实表', 'CREATE TABLE orders (day_key date, status text)', 1000)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO field_context (task_id, table_id, field_name, field_type, business_meaning)
             VALUES (1, 1, 'status', 'text', '订单状态')",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }

    async fn seed_example(store: &SqliteStore) {
        store
            .insert_qa_example(
                1,
                "今天有多少订单？",
                "SELECT COUNT(*) FROM orders WHERE day_key = CURRENT_DATE",
                &[],
                &[],
            )
            .await
            .unwrap();
    }

    fn orchestrator(
        store: Arc<SqliteStore>,
        chat: Arc<ScriptedChat>,
        executor: Arc<ScriptedExecutor>,
    ) -> ChatOrchestrator {
        ChatOrchestrator::with_factories(
            store.clone(),
            store,
            Box::new(move |_| Ok(chat.clone() as Arc<dyn ChatApi>)),
            Box::new(move |_| Ok(executor.clone() as Arc<dyn ExecuteSql>)),
        )
    }

    fn rows_envelope(sql: &str) -> ExecutionEnvelope {
        ExecutionEnvelope::ok(sql, vec![serde_json::json!({"count": 12})], None, 0.01)
    }

    #[tokio::test]
    async fn high_similarity_executes_directly_without_table_selection() {
        let store = seed_store().await;
        seed_catalog(&store).await;
        seed_example(&store).await;

        let chat = Arc::new(ScriptedChat::new(vec![MATCH_95]));
        let executor = Arc::new(ScriptedExecutor::new(vec![rows_envelope("matched")]));
        let orchestrator = orchestrator(store.clone(), chat.clone(), executor.clone());

        let response =
            orchestrator.ask(AskRequest::new(1, "昨天有多少订单？")).await.unwrap();

        // Exactly one LLM call: the matcher. The selector never ran.
        assert_eq!(chat.calls(), 1);
        assert!(response.select_table_result.is_none());
        assert_eq!(response.conversation.answer.as_deref(), Some("已匹配到高相似度问答对并执行SQL。"));
        assert_eq!(
            response.conversation.sql_generated.as_deref(),
            Some("SELECT COUNT(*) FROM orders WHERE day_key = '2025-12-05'")
        );
        assert!(response.conversation.sql_data.is_some());
        assert_eq!(response.session.conversation_count, 1);
    }

    #[tokio::test]
    async fn low_similarity_runs_the_full_pipeline() {
        let store = seed_store().await;
        seed_catalog(&store).await;
        seed_example(&store).await;

        let selector_reply = r#"{"selected_tables": ["orders"], "reason": "订单相关"}"#;
        let context_reply =
            "ALLOWED_TABLES=orders\nDRIVER_TABLE=orders\nTABLE_USAGE.orders.WHERE_FIELDS=status";
        let patch_reply = "[TABLE] orders\nWHERE status = '已支付'\nREASON: 状态规则";
        let generate_reply = "【SQL】\nSELECT COUNT(*) FROM orders WHERE status = '已支付'\n【理由】\n1. 订单表";

        let chat = Arc::new(ScriptedChat::new(vec![
            MATCH_50,
            selector_reply,
            context_reply,
            patch_reply,
            generate_reply,
        ]));
        let executor = Arc::new(ScriptedExecutor::new(vec![rows_envelope("generated")]));
        let orchestrator = orchestrator(store.clone(), chat.clone(), executor.clone());

        let response =
            orchestrator.ask(AskRequest::new(1, "已支付订单有多少？")).await.unwrap();

        assert_eq!(chat.calls(), 5);
        assert_eq!(response.conversation.answer.as_deref(), Some("相似度低于阈值，已触发选表代理。"));

        let selection = response.select_table_result.as_ref().unwrap();
        assert_eq!(selection.selected_tables[0].table_name, "orders");
        assert_eq!(selection.candidate_count, 1);

        let context = response.query_context.as_ref().unwrap();
        assert_eq!(context.table_usage["orders"].filter_fields, vec!["status"]);

        let patches = response.column_patch.as_ref().unwrap();
        assert_eq!(patches.column_patches["orders"].where_clause, "WHERE status = '已支付'");

        assert_eq!(
            response.conversation.sql_generated.as_deref(),
            Some("SELECT COUNT(*) FROM orders WHERE status = '已支付'")
        );
        assert!(response.sql_fix_result.is_none());

        // The persisted row carries the serialized artifacts.
        assert!(response.conversation.selected_tables.is_some());
        assert!(response.conversation.query_context.is_some());
        assert!(response.conversation.column_patch.is_some());
    }

    #[tokio::test]
    async fn no_examples_falls_through_and_empty_catalog_stops_early() {
        let store = seed_store().await;
        // No qa examples, no table contexts.

        let chat = Arc::new(ScriptedChat::new(vec![]));
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = orchestrator(store.clone(), chat.clone(), executor.clone());

        let response = orchestrator.ask(AskRequest::new(1, "有多少订单？")).await.unwrap();

        // Matcher short-circuits, selector answers without an LLM call.
        assert_eq!(chat.calls(), 0);
        let selection = response.select_table_result.as_ref().unwrap();
        assert!(selection.selected_tables.is_empty());
        assert_eq!(selection.reason, "当前任务没有可用的表元数据或表级提示词");
        assert!(response.conversation.sql_generated.is_none());
        assert!(response.query_context.is_none());
        assert_eq!(response.conversation.answer.as_deref(), Some("相似度低于阈值，已触发选表代理。"));
    }

    #[tokio::test]
    async fn fixer_exhaustion_persists_the_turn_then_raises() {
        let store = seed_store().await;
        seed_catalog(&store).await;
        seed_example(&store).await;

        let chat = Arc::new(ScriptedChat::new(vec![
            MATCH_95,
            "SELECT 1 FROM fix_a",
            "SELECT 1 FROM fix_b",
            "SELECT 1 FROM fix_c",
        ]));
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ExecutionEnvelope::failed("matched", "boom 0".to_string()),
            ExecutionEnvelope::failed("a", "boom 1".to_string()),
            ExecutionEnvelope::failed("b", "boom 2".to_string()),
            ExecutionEnvelope::failed("c", "boom 3".to_string()),
        ]));
        let orchestrator = orchestrator(store.clone(), chat.clone(), executor.clone());

        let error = orchestrator.ask(AskRequest::new(1, "昨天有多少订单？")).await.unwrap_err();
        assert!(matches!(error, AppError::Executor(_)));
        assert!(error.to_string().contains("boom 3"));

        // The turn was still persisted before the error propagated.
        let session = store.get_session(1).await.unwrap().unwrap();
        assert_eq!(store.count_conversations(session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_task_and_disabled_llm_abort_before_the_pipeline() {
        let store = seed_store().await;
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = orchestrator(store.clone(), chat.clone(), executor.clone());

        let error = orchestrator.ask(AskRequest::new(999, "q")).await.unwrap_err();
        assert!(matches!(error, AppError::NotFound(_)));

        sqlx::query("UPDATE llm_config SET enabled = 0 WHERE id = 1")
            .execute(store.pool())
            .await
            .unwrap();
        let error = orchestrator.ask(AskRequest::new(1, "q")).await.unwrap_err();
        assert!(matches!(error, AppError::Disabled(_)));
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn session_must_belong_to_the_task() {
        let store = seed_store().await;
        // A second task sharing the configs.
        sqlx::query("INSERT INTO task (name, db_config_id, llm_config_id) VALUES ('other', 1, 1)")
            .execute(store.pool())
            .await
            .unwrap();
        let foreign = store.create_session(2, "其他任务的会话").await.unwrap();

        let chat = Arc::new(ScriptedChat::new(vec![]));
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = orchestrator(store.clone(), chat, executor);

        let mut request = AskRequest::new(1, "q");
        request.session_id = Some(foreign.id);
        let error = orchestrator.ask(request).await.unwrap_err();
        assert!(matches!(error, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn long_questions_become_truncated_session_titles() {
        let store = seed_store().await;
        let chat = Arc::new(ScriptedChat::new(vec![]));
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = orchestrator(store.clone(), chat, executor);

        let question = "统计二零二五年十二月每一天每个地区每种机型的航班数量并排序";
        let response = orchestrator.ask(AskRequest::new(1, question)).await.unwrap();
        assert!(response.session.title.ends_with("..."));
        assert_eq!(response.session.title.chars().count(), 24 + 3);
    }

    #[tokio::test]
    async fn harvesting_turns_a_conversation_into_an_example() {
        let store = seed_store().await;
        let session = store.create_session(1, "s").await.unwrap();
        let conversation = store
            .insert_conversation(NewConversation {
                session_id: session.id,
                task_id: 1,
                question: "昨天有多少订单？".to_string(),
                sql_generated: Some("SELECT COUNT(*) FROM orders WHERE day_key = '2025-12-05'".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let harvest_reply = r#"{"where_conditions": [{"field": "day_key", "operator": "eq", "value": "2025-12-05", "description": "日期"}], "tables": ["orders"]}"#;
        let chat = Arc::new(ScriptedChat::new(vec![harvest_reply]));
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = orchestrator(store.clone(), chat, executor);

        let example_id = orchestrator.harvest_qa_example(conversation.id).await.unwrap();
        assert!(example_id > 0);

        let examples = store.list_enabled_qa_examples(1).await.unwrap();
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].where_conditions[0].field, "day_key");
        assert_eq!(examples[0].tables, vec!["orders"]);
    }
}
