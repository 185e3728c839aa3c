//! Table selection: picks the 1-3 catalog tables most relevant to a question
//! from their semantic profiles.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::parse::parse_json_object;
use crate::store::{Id, TableContext};

#[derive(Debug, Clone, Serialize)]
pub struct SelectedTable {
    pub table_name: String,
    pub table_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionOutcome {
    pub selected_tables: Vec<SelectedTable>,
    pub reason: String,
    pub candidate_count: usize,
}

pub struct TableSelector<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
}

impl<'a> TableSelector<'a> {
    pub fn new(chat: &'a dyn ChatApi, options: ChatOptions) -> Self {
        Self { chat, options }
    }

    /// Selects from the active candidates. An empty catalog is answered
    /// directly, without an LLM call; names the model invents are dropped.
    pub async fn select(&self, question: &str, catalog: &[TableContext]) -> Result<SelectionOutcome> {
        let candidates: Vec<&TableContext> = catalog.iter().filter(|t| t.is_active).collect();
        if candidates.is_empty() {
            return Ok(SelectionOutcome {
                selected_tables: Vec::new(),
                reason: "当前任务没有可用的表元数据或表级提示词".to_string(),
                candidate_count: 0,
            });
        }

        let prompt = build_selection_prompt(question, &candidates);
        let reply = self
            .chat
            .chat(
                &[ChatMessage::system("你是一个严谨的数据分析选表助手。"), ChatMessage::user(prompt)],
                self.options,
            )
            .await?;

        let parsed = parse_json_object(&reply);
        let reason = parsed.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let name_to_id: HashMap<&str, Id> =
            candidates.iter().map(|t| (t.table_name.as_str(), t.id)).collect();

        let mut selected = Vec::new();
        if let Some(names) = parsed.get("selected_tables").and_then(|v| v.as_array()) {
            for name in names {
                let Some(name) = name.as_str() else { continue };
                let name = name.trim();
                match name_to_id.get(name) {
                    Some(&table_id) => {
                        selected.push(SelectedTable { table_name: name.to_string(), table_id })
                    }
                    None => warn!("selector returned unknown table '{}', dropping", name),
                }
            }
        }

        debug!("selected {}/{} candidate tables", selected.len(), candidates.len());
        Ok(SelectionOutcome { selected_tables: selected, reason, candidate_count: candidates.len() })
    }
}

fn build_selection_prompt(question: &str, candidates: &[&TableContext]) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("你是一个选表助手，需要根据用户问题从候选表中选择最相关的1-3张表。".to_string());
    lines.push("仅返回JSON，不要markdown。".to_string());
    lines.push("\n用户问题:".to_string());
    lines.push(question.to_string());
    lines.push("\n候选表:".to_string());

    for (index, table) in candidates.iter().enumerate() {
        lines.push(format!("{}. table_name={}", index + 1, table.table_name));
        lines.push(format!("   table_id={}", table.id));
        lines.push(format!("   table_description={}", table.description.as_deref().unwrap_or_default()));
        lines.push(format!(
            "   query_scenarios={}",
            serde_json::to_string(&table.query_scenarios).unwrap_or_default()
        ));
        lines.push(format!(
            "   aggregation_scenarios={}",
            serde_json::to_string(&table.aggregation_scenarios).unwrap_or_default()
        ));
        lines.push(format!(
            "   data_role={}",
            serde_json::to_string(&table.data_role).unwrap_or_default()
        ));
        lines.push(format!(
            "   usage_not_scenarios={}",
            serde_json::to_string(&table.usage_not_scenarios).unwrap_or_default()
        ));
    }

    lines.push(
        "\n输出格式:\n{\n  \"selected_tables\": [\"table_a\", \"table_b\"],\n  \"reason\": \"简要说明原因\"\n}"
            .to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedChat;

    fn table(id: Id, name: &str, active: bool) -> TableContext {
        TableContext {
            id,
            task_id: 1,
            table_name: name.to_string(),
            description: Some(format!("{} 表", name)),
            query_scenarios: vec!["按日统计".to_string()],
            aggregation_scenarios: Vec::new(),
            data_role: Vec::new(),
            usage_not_scenarios: Vec::new(),
            ddl: None,
            row_count: None,
            sample_rows: Vec::new(),
            is_active: active,
        }
    }

    #[tokio::test]
    async fn empty_catalog_short_circuits_without_llm_call() {
        let chat = ScriptedChat::new(vec![]);
        let selector = TableSelector::new(&chat, ChatOptions::new(0.2, None));
        let outcome = selector.select("今天有多少订单？", &[]).await.unwrap();
        assert!(outcome.selected_tables.is_empty());
        assert_eq!(outcome.reason, "当前任务没有可用的表元数据或表级提示词");
        assert_eq!(outcome.candidate_count, 0);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn inactive_tables_are_not_candidates() {
        let chat = ScriptedChat::new(vec![]);
        let selector = TableSelector::new(&chat, ChatOptions::new(0.2, None));
        let outcome = selector
            .select("q", &[table(1, "orders", false)])
            .await
            .unwrap();
        assert_eq!(outcome.candidate_count, 0);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_names_are_dropped_known_ones_resolve_ids() {
        let reply = r#"```json
{"selected_tables": ["orders", "made_up_table"], "reason": "订单相关"}
```"#;
        let chat = ScriptedChat::new(vec![reply]);
        let selector = TableSelector::new(&chat, ChatOptions::new(0.2, None));
        let outcome = selector
            .select("今天有多少订单？", &[table(7, "orders", true), table(8, "users", true)])
            .await
            .unwrap();
        assert_eq!(outcome.selected_tables.len(), 1);
        assert_eq!(outcome.selected_tables[0].table_name, "orders");
        assert_eq!(outcome.selected_tables[0].table_id, 7);
        assert_eq!(outcome.candidate_count, 2);
        assert_eq!(outcome.reason, "订单相关");
    }

    #[tokio::test]
    async fn garbage_reply_yields_empty_selection() {
        let chat = ScriptedChat::new(vec!["抱歉，我无法完成这个任务。"]);
        let selector = TableSelector::new(&chat, ChatOptions::new(0.2, None));
        let outcome = selector.select("q", &[table(1, "orders", true)]).await.unwrap();
        assert!(outcome.selected_tables.is_empty());
        assert_eq!(outcome.candidate_count, 1);
    }
}
