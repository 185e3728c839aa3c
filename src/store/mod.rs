pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type Id = i64;

/// Task lifecycle ladder, advanced by the profile-generation stage. The
/// conversational pipeline only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initialized,
    MetadataExtracted,
    TablePromptsGenerated,
    FieldPromptsGenerated,
    RelationsGenerated,
    Complete,
}

impl TaskStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::MetadataExtracted,
            2 => Self::TablePromptsGenerated,
            3 => Self::FieldPromptsGenerated,
            4 => Self::RelationsGenerated,
            5 => Self::Complete,
            _ => Self::Initialized,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Initialized => 0,
            Self::MetadataExtracted => 1,
            Self::TablePromptsGenerated => 2,
            Self::FieldPromptsGenerated => 3,
            Self::RelationsGenerated => 4,
            Self::Complete => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Id,
    pub name: String,
    pub db_config_id: Id,
    pub llm_config_id: Id,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmSettings {
    pub id: Id,
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub enabled: bool,
}

impl LlmSettings {
    pub fn chat_options(&self) -> crate::llm::ChatOptions {
        crate::llm::ChatOptions::new(self.temperature, self.max_tokens)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbSettings {
    pub id: Id,
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database_name: String,
    pub schema_name: Option<String>,
}

/// Operator-provided note lists folded into profile generation prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPromptConfig {
    pub system_notes: Vec<String>,
    pub table_notes: Vec<String>,
    pub field_notes: Vec<String>,
}

/// A table's semantic profile plus physical facts, as consumed by the
/// selection and generation agents.
#[derive(Debug, Clone, Serialize)]
pub struct TableContext {
    pub id: Id,
    pub task_id: Id,
    pub table_name: String,
    pub description: Option<String>,
    pub query_scenarios: Vec<String>,
    pub aggregation_scenarios: Vec<String>,
    pub data_role: Vec<String>,
    pub usage_not_scenarios: Vec<String>,
    pub ddl: Option<String>,
    pub row_count: Option<i64>,
    pub sample_rows: Vec<serde_json::Value>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldContext {
    pub id: Id,
    pub task_id: Id,
    pub table_id: Id,
    pub field_name: String,
    pub field_type: Option<String>,
    pub business_meaning: Option<String>,
    pub data_format: Option<String>,
    pub description: Option<String>,
    pub query_scenarios: Vec<String>,
    pub rules: Vec<String>,
    pub null_rate: Option<f64>,
    pub unique_count: Option<i64>,
    pub sample_values: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRelation {
    pub source_table: String,
    pub source_field: String,
    pub target_table: String,
    pub target_field: String,
    pub relation_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhereCondition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QaExample {
    pub id: Id,
    pub task_id: Id,
    pub question: String,
    pub sql: String,
    pub where_conditions: Vec<WhereCondition>,
    pub tables: Vec<String>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: Id,
    pub task_id: Id,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Id,
    pub session_id: Id,
    pub task_id: Id,
    pub question: String,
    pub answer: Option<String>,
    pub description: Option<String>,
    pub is_right: Option<bool>,
    pub sql_generated: Option<String>,
    pub sql_result: Option<String>,
    pub selected_tables: Option<String>,
    pub query_context: Option<String>,
    pub column_patch: Option<String>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a conversation row as written by the orchestrator. The JSON
/// blobs arrive pre-serialized; the row is immutable afterwards except for
/// the feedback trio.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub session_id: Id,
    pub task_id: Id,
    pub question: String,
    pub answer: Option<String>,
    pub description: Option<String>,
    pub is_right: Option<bool>,
    pub sql_generated: Option<String>,
    pub sql_result: Option<String>,
    pub selected_tables: Option<String>,
    pub query_context: Option<String>,
    pub column_patch: Option<String>,
}

/// Semantic profile written back by the field-profile generation stage.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldProfile {
    pub field_name: String,
    #[serde(default)]
    pub business_meaning: Option<String>,
    #[serde(default)]
    pub data_format: Option<String>,
    #[serde(default)]
    pub field_description: Option<String>,
    #[serde(default)]
    pub query_scenarios: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Semantic profile written back by the table-profile generation stage.
#[derive(Debug, Clone, Deserialize)]
pub struct TableProfile {
    pub table_description: String,
    #[serde(default)]
    pub query_scenarios: Vec<String>,
    #[serde(default)]
    pub aggregation_scenarios: Vec<String>,
    #[serde(default)]
    pub data_role: Vec<String>,
    #[serde(default)]
    pub usage_not_scenarios: Vec<String>,
}

/// Read (and, for the profiler, write) access to a task's configuration and
/// scanned catalog.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_task(&self, task_id: Id) -> Result<Option<Task>>;
    async fn get_llm_settings(&self, id: Id) -> Result<Option<LlmSettings>>;
    async fn get_db_settings(&self, id: Id) -> Result<Option<DbSettings>>;
    async fn get_user_prompt_config(&self, task_id: Id) -> Result<UserPromptConfig>;

    async fn list_table_contexts(&self, task_id: Id) -> Result<Vec<TableContext>>;
    async fn get_table_context(&self, task_id: Id, table_name: &str) -> Result<Option<TableContext>>;
    async fn list_field_contexts(&self, task_id: Id, table_id: Id) -> Result<Vec<FieldContext>>;
    async fn list_relations(&self, task_id: Id, table_names: &[String]) -> Result<Vec<TableRelation>>;

    async fn list_enabled_qa_examples(&self, task_id: Id) -> Result<Vec<QaExample>>;
    async fn insert_qa_example(
        &self,
        task_id: Id,
        question: &str,
        sql: &str,
        where_conditions: &[WhereCondition],
        tables: &[String],
    ) -> Result<Id>;

    async fn update_task_status(&self, task_id: Id, status: TaskStatus) -> Result<()>;
    async fn update_table_profile(&self, table_id: Id, profile: &TableProfile) -> Result<()>;
    async fn replace_field_profiles(
        &self,
        task_id: Id,
        table_id: Id,
        profiles: &[FieldProfile],
    ) -> Result<()>;
    async fn insert_relations(&self, task_id: Id, relations: &[TableRelation]) -> Result<()>;
}

/// Persistence boundary for chat sessions and conversation turns.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_session(&self, session_id: Id) -> Result<Option<ChatSession>>;
    async fn create_session(&self, task_id: Id, title: &str) -> Result<ChatSession>;
    async fn touch_session(&self, session_id: Id) -> Result<()>;
    async fn rename_session(&self, session_id: Id, title: &str) -> Result<Option<ChatSession>>;
    async fn delete_session(&self, session_id: Id) -> Result<bool>;
    async fn count_conversations(&self, session_id: Id) -> Result<i64>;

    async fn insert_conversation(&self, row: NewConversation) -> Result<Conversation>;
    async fn get_conversation(&self, id: Id) -> Result<Option<Conversation>>;
    async fn update_feedback(
        &self,
        id: Id,
        is_right: Option<bool>,
        description: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<Option<Conversation>>;
}
