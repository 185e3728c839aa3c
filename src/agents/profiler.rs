//! Semantic profile generation: produces the table/field descriptions and
//! cross-table relations the conversational pipeline consumes, advancing the
//! task's lifecycle status as each stage lands. Every call runs under the
//! shared shrink-and-retry policy.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{AppError, Result};
use crate::llm::retry::chat_with_shrink;
use crate::llm::{ChatApi, ChatMessage, ChatOptions, LlmError};
use crate::parse::{parse_json_flexible, parse_json_object};
use crate::store::{
    FieldContext, FieldProfile, Id, MetadataStore, TableContext, TableProfile, TableRelation,
    TaskStatus, UserPromptConfig,
};

#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub tables_profiled: usize,
    pub fields_profiled: usize,
    pub relations_found: usize,
    pub status: TaskStatus,
}

pub struct SemanticProfiler<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    store: &'a dyn MetadataStore,
    task_id: Id,
}

impl<'a> SemanticProfiler<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        options: ChatOptions,
        store: &'a dyn MetadataStore,
        task_id: Id,
    ) -> Self {
        Self { chat, options, store, task_id }
    }

    /// Runs the three generation stages in order: table profiles, field
    /// profiles, pairwise relations. Each stage persists its results and
    /// bumps the task status before the next starts.
    pub async fn run(&self) -> Result<ProfileReport> {
        let task = self
            .store
            .get_task(self.task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("任务ID {}", self.task_id)))?;
        let notes = self.store.get_user_prompt_config(self.task_id).await?;
        let contexts = self.store.list_table_contexts(self.task_id).await?;
        info!("profiling task {} ({} tables)", task.id, contexts.len());

        for table in &contexts {
            let profile = self.generate_table_profile(table, &notes).await?;
            self.store.update_table_profile(table.id, &profile).await?;
        }
        self.store.update_task_status(self.task_id, TaskStatus::TablePromptsGenerated).await?;

        let mut fields_profiled = 0;
        for table in &contexts {
            let fields = self.store.list_field_contexts(self.task_id, table.id).await?;
            if fields.is_empty() {
                continue;
            }
            let profiles = self.generate_field_profiles(table, &fields, &notes).await?;
            fields_profiled += profiles.len();
            self.store.replace_field_profiles(self.task_id, table.id, &profiles).await?;
        }
        self.store.update_task_status(self.task_id, TaskStatus::FieldPromptsGenerated).await?;

        let mut relations_found = 0;
        for (index, source) in contexts.iter().enumerate() {
            for target in contexts.iter().skip(index + 1) {
                let relations = self.generate_relations(source, target).await?;
                relations_found += relations.len();
                self.store.insert_relations(self.task_id, &relations).await?;
            }
        }
        self.store.update_task_status(self.task_id, TaskStatus::RelationsGenerated).await?;
        self.store.update_task_status(self.task_id, TaskStatus::Complete).await?;

        Ok(ProfileReport {
            tables_profiled: contexts.len(),
            fields_profiled,
            relations_found,
            status: TaskStatus::Complete,
        })
    }

    async fn generate_table_profile(
        &self,
        table: &TableContext,
        notes: &UserPromptConfig,
    ) -> Result<TableProfile> {
        let system = "你是一个专业的数据分析专家，擅长为数据表生成精确的提示词描述。\n\n\
                      请根据提供的表结构信息，生成一个严格符合JSON格式的响应。\
                      响应必须是一个有效的JSON对象，不要包含任何markdown代码块标记（如```json或```）。\n\n\
                      JSON格式如下：\n\
                      {\n\
                        \"table_description\": \"表的详细描述\",\n\
                        \"query_scenarios\": [\"查询场景1\", \"查询场景2\"],\n\
                        \"aggregation_scenarios\": [\"聚合场景1\", \"聚合场景2\"],\n\
                        \"data_role\": [\"角色1\", \"角色2\"],\n\
                        \"usage_not_scenarios\": [\"不适合场景1\", \"不适合场景2\"]\n\
                      }\n\n\
                      注意事项：\n\
                      1. table_description：用简洁明确的语言描述表的用途和内容\n\
                      2. query_scenarios：列出3-5个常见的查询场景\n\
                      3. aggregation_scenarios：列出2-4个聚合分析场景\n\
                      4. data_role：列出此表在数据库中扮演的角色\n\
                      5. usage_not_scenarios：列出不适合使用此表的场景\n\
                      6. 直接返回JSON对象，不要使用任何markdown格式";

        let fields = self.store.list_field_contexts(self.task_id, table.id).await?;
        let mut prompt = format!(
            "请为以下表生成提示词描述：\n\n表名：{}\n\n系统级别描述：\n{}\n\n表注意事项：\n{}\n\n表DDL：\n{}\n\n表行数：{}\n\n字段信息：\n",
            table.table_name,
            join_notes(&notes.system_notes),
            join_notes(&notes.table_notes),
            table.ddl.as_deref().unwrap_or_default(),
            table.row_count.map_or_else(|| "未知".to_string(), |n| n.to_string()),
        );
        for field in &fields {
            prompt.push_str(&format!(
                "- {} ({})\n  空值率：{}\n  唯一值数：{}\n  样例数据：{}\n",
                field.field_name,
                field.field_type.as_deref().unwrap_or("unknown"),
                field.null_rate.map_or_else(|| "未知".to_string(), |r| r.to_string()),
                field.unique_count.map_or_else(|| "未知".to_string(), |n| n.to_string()),
                compact_text(field.sample_values.as_deref().unwrap_or("无"), 100),
            ));
        }
        prompt.push_str(&format!("\n样例数据：\n{}\n\n请基于以上信息生成JSON格式的提示词响应。", compact_samples(&table.sample_rows)));

        let reply = chat_with_shrink(
            self.chat,
            &[ChatMessage::system(system), ChatMessage::user(prompt)],
            self.options,
        )
        .await?;

        let parsed = parse_json_object(&reply);
        serde_json::from_value::<TableProfile>(parsed)
            .map_err(|_| AppError::Llm(LlmError::Response("表级提示词返回格式错误".to_string())))
    }

    async fn generate_field_profiles(
        &self,
        table: &TableContext,
        fields: &[FieldContext],
        notes: &UserPromptConfig,
    ) -> Result<Vec<FieldProfile>> {
        let system = "你是一个专业的数据分析专家，擅长为数据表的所有字段生成精确的提示词描述。\n\n\
                      请根据提供的表信息和所有字段信息，生成一个严格符合JSON格式的响应。\
                      响应必须是一个有效的JSON对象，不要包含任何markdown代码块标记（如```json或```）。\n\n\
                      JSON格式如下：\n\
                      {\n\
                        \"fields\": [\n\
                          {\n\
                            \"field_name\": \"字段名称\",\n\
                            \"business_meaning\": \"字段的业务含义\",\n\
                            \"data_format\": \"数据格式说明\",\n\
                            \"field_description\": \"字段的详细描述\",\n\
                            \"query_scenarios\": [\"查询场景1\", \"查询场景2\"],\n\
                            \"rules\": [\"规则1\", \"规则2\"]\n\
                          }\n\
                        ]\n\
                      }\n\n\
                      直接返回JSON对象，不要使用markdown格式。";

        let mut prompt = format!(
            "请为以下表的字段生成提示词：\n\n表名：{}\n\n系统级描述：\n{}\n\n字段注意事项：\n{}\n\n表DDL：\n{}\n\n表描述：{}\n表行数：{}\n\n字段信息：\n",
            table.table_name,
            join_notes(&notes.system_notes),
            join_notes(&notes.field_notes),
            table.ddl.as_deref().unwrap_or_default(),
            table.description.as_deref().unwrap_or_default(),
            table.row_count.map_or_else(|| "未知".to_string(), |n| n.to_string()),
        );
        for field in fields {
            prompt.push_str(&format!(
                "- 字段名: {}\n  类型: {}\n  空值率: {}\n  唯一值数: {}\n  样例数据: {}\n",
                field.field_name,
                field.field_type.as_deref().unwrap_or("unknown"),
                field.null_rate.map_or_else(|| "未知".to_string(), |r| r.to_string()),
                field.unique_count.map_or_else(|| "未知".to_string(), |n| n.to_string()),
                compact_text(field.sample_values.as_deref().unwrap_or("无"), 100),
            ));
        }
        prompt.push_str("\n请生成JSON返回，且每个字段必须包含 field_name。");

        let reply = chat_with_shrink(
            self.chat,
            &[ChatMessage::system(system), ChatMessage::user(prompt)],
            self.options,
        )
        .await?;

        let parsed = parse_json_flexible(&reply)
            .ok_or_else(|| AppError::Llm(LlmError::Response("字段提示词返回格式错误".to_string())))?;
        let raw = match parsed {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("fields") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(AppError::Llm(LlmError::Response(
                        "字段提示词返回格式错误".to_string(),
                    )))
                }
            },
            _ => {
                return Err(AppError::Llm(LlmError::Response("字段提示词返回格式错误".to_string())))
            }
        };

        Ok(raw
            .into_iter()
            .filter_map(|item| serde_json::from_value::<FieldProfile>(item).ok())
            .filter(|profile| !profile.field_name.is_empty())
            .collect())
    }

    async fn generate_relations(
        &self,
        source: &TableContext,
        target: &TableContext,
    ) -> Result<Vec<TableRelation>> {
        let system = "你是资深数据建模专家。请分析两个表之间的字段关系，仅返回有实际业务价值的关联。\n\
                      必须排除无业务意义或弱意义的字段关系，例如 is_delete、deleted、create_time、created_at、update_time、updated_at、timestamp 等系统/审计时间字段。\n\
                      输出必须是JSON数组，不要markdown。每项格式：\n\
                      {\n\
                        \"source_field\": \"源字段名\",\n\
                        \"target_field\": \"目标字段名\",\n\
                        \"relation_type\": \"foreign_key|reference|business_key\",\n\
                        \"relation_description\": \"简明业务说明\",\n\
                        \"confidence\": 0.0\n\
                      }\n\
                      如果没有高价值关联，返回 []。";

        let source_fields = self.store.list_field_contexts(self.task_id, source.id).await?;
        let target_fields = self.store.list_field_contexts(self.task_id, target.id).await?;

        let prompt = format!(
            "请分析以下两张表之间的业务字段关联关系。\n\n\
             源表: {}\n源表提示: {}\n源表字段:\n{}\n\n\
             目标表: {}\n目标表提示: {}\n目标表字段:\n{}\n\n\
             只返回有业务价值的字段关系JSON数组，禁止返回系统字段时间字段的弱关系。",
            source.table_name,
            source.description.as_deref().unwrap_or_default(),
            fields_to_text(&source_fields),
            target.table_name,
            target.description.as_deref().unwrap_or_default(),
            fields_to_text(&target_fields),
        );

        let reply = chat_with_shrink(
            self.chat,
            &[ChatMessage::system(system), ChatMessage::user(prompt)],
            self.options,
        )
        .await?;

        let Some(Value::Array(items)) = parse_json_flexible(&reply) else {
            return Ok(Vec::new());
        };

        let mut relations = Vec::new();
        for item in items {
            let source_field = item.get("source_field").and_then(|v| v.as_str()).unwrap_or_default();
            let target_field = item.get("target_field").and_then(|v| v.as_str()).unwrap_or_default();
            let relation_type = item.get("relation_type").and_then(|v| v.as_str()).unwrap_or_default();
            if source_field.is_empty() || target_field.is_empty() || relation_type.is_empty() {
                continue;
            }
            relations.push(TableRelation {
                source_table: source.table_name.clone(),
                source_field: source_field.to_string(),
                target_table: target.table_name.clone(),
                target_field: target_field.to_string(),
                relation_type: relation_type.to_string(),
                description: item
                    .get("relation_description")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            });
        }
        Ok(relations)
    }
}

fn join_notes(notes: &[String]) -> String {
    if notes.is_empty() {
        "无".to_string()
    } else {
        notes.join("\n")
    }
}

fn fields_to_text(fields: &[FieldContext]) -> String {
    fields
        .iter()
        .map(|field| {
            format!(
                "- {} ({}) | 业务含义: {} | 描述: {} | 样例: {}",
                field.field_name,
                field.field_type.as_deref().unwrap_or("unknown"),
                field.business_meaning.as_deref().unwrap_or_default(),
                field.description.as_deref().unwrap_or_default(),
                compact_text(field.sample_values.as_deref().unwrap_or_default(), 100),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn compact_text(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Sample rows compacted for prompt use: at most 3 rows, long string values
/// truncated, total payload bounded.
fn compact_samples(samples: &[Value]) -> String {
    if samples.is_empty() {
        return "无".to_string();
    }
    let compact: Vec<Value> = samples
        .iter()
        .take(3)
        .map(|sample| match sample {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::String(s) if s.chars().count() > 200 => {
                                Value::String(s.chars().take(200).collect())
                            }
                            other => other.clone(),
                        };
                        (key.clone(), value)
                    })
                    .collect(),
            ),
            other => other.clone(),
        })
        .collect();
    let text = serde_json::to_string(&compact).unwrap_or_else(|_| "无".to_string());
    compact_text(&text, 2000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::testutil::ScriptedChat;

    async fn seed_two_tables(store: &SqliteStore) {
        sqlx::query("INSERT INTO llm_config (base_url, api_key, model_name) VALUES ('u', 'k', 'm')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO db_config (db_type, host, port, username, password, database_name)
             VALUES ('pg', 'h', 5432, 'u', 'p', 'd')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO task (name, db_config_id, llm_config_id, status) VALUES ('t', 1, 1, 1)")
            .execute(store.pool())
            .await
            .unwrap();
        for (name, ddl) in [("orders", "CREATE TABLE orders (...)"), ("users", "CREATE TABLE users (...)")] {
            sqlx::query("INSERT INTO table_context (task_id, table_name, ddl, row_count) VALUES (1, ?, ?, 100)")
                .bind(name)
                .bind(ddl)
                .execute(store.pool())
                .await
                .unwrap();
        }
        for (table_id, field) in [(1, "user_id"), (2, "id")] {
            sqlx::query(
                "INSERT INTO field_context (task_id, table_id, field_name, field_type) VALUES (1, ?, ?, 'bigint')",
            )
            .bind(table_id)
            .bind(field)
            .execute(store.pool())
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn runs_all_three_stages_and_completes_the_task() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        seed_two_tables(&store).await;

        let table_profile = r#"{"table_description": "描述", "query_scenarios": ["场景"], "aggregation_scenarios": [], "data_role": ["事实表"], "usage_not_scenarios": []}"#;
        let field_profiles = r#"{"fields": [{"field_name": "user_id", "business_meaning": "用户ID"}]}"#;
        let field_profiles_users = r#"{"fields": [{"field_name": "id", "business_meaning": "主键"}]}"#;
        let relations = r#"[{"source_field": "user_id", "target_field": "id", "relation_type": "foreign_key", "relation_description": "订单归属用户", "confidence": 0.9}]"#;

        let chat = ScriptedChat::new(vec![
            table_profile,
            table_profile,
            field_profiles,
            field_profiles_users,
            relations,
        ]);
        let profiler = SemanticProfiler::new(&chat, ChatOptions::new(0.7, Some(4096)), &store, 1);
        let report = profiler.run().await.unwrap();

        assert_eq!(report.tables_profiled, 2);
        assert_eq!(report.fields_profiled, 2);
        assert_eq!(report.relations_found, 1);
        assert_eq!(report.status, TaskStatus::Complete);

        let task = store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);

        let contexts = store.list_table_contexts(1).await.unwrap();
        assert_eq!(contexts[0].description.as_deref(), Some("描述"));

        let names = vec!["orders".to_string(), "users".to_string()];
        let stored_relations = store.list_relations(1, &names).await.unwrap();
        assert_eq!(stored_relations.len(), 1);
        assert_eq!(stored_relations[0].source_field, "user_id");
    }

    #[tokio::test]
    async fn malformed_table_profile_is_a_format_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        seed_two_tables(&store).await;

        let chat = ScriptedChat::new(vec!["这不是JSON"]);
        let profiler = SemanticProfiler::new(&chat, ChatOptions::new(0.7, Some(4096)), &store, 1);
        let error = profiler.run().await.unwrap_err();
        assert!(error.to_string().contains("表级提示词返回格式错误"));
    }
}
