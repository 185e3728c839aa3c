//! Query-context construction: classifies how each field of the selected
//! tables is used (filter, group, aggregate, join) through a strict line
//! protocol, parsed leniently.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::store::{Id, MetadataStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableUsage {
    pub filter_fields: Vec<String>,
    pub group_by_fields: Vec<String>,
    pub agg_fields: Vec<String>,
    pub join_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub from: String,
    pub to: String,
}

/// Per-question usage contract constraining SQL generation. Ephemeral: it
/// lives for one question-answer cycle and is serialized into the
/// conversation row, never persisted on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryContext {
    pub allowed_tables: Vec<String>,
    pub driver_table: Option<String>,
    pub joins: Vec<Join>,
    pub table_usage: BTreeMap<String, TableUsage>,
}

impl QueryContext {
    pub fn is_empty(&self) -> bool {
        self.allowed_tables.is_empty()
            && self.driver_table.is_none()
            && self.joins.is_empty()
            && self.table_usage.is_empty()
    }

    /// All fields the context references for one table, across usages and
    /// join endpoints. Drives the field filtering in SQL generation.
    pub fn relevant_fields(&self, table_name: &str) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        let mut push = |field: &str| {
            if !field.is_empty() && !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        };

        if let Some(usage) = self.table_usage.get(table_name) {
            usage.filter_fields.iter().for_each(|f| push(f));
            usage.group_by_fields.iter().for_each(|f| push(f));
            usage.agg_fields.iter().for_each(|f| push(f));
            if let Some(join_key) = &usage.join_key {
                push(join_key);
            }
        }

        for join in &self.joins {
            for endpoint in [&join.from, &join.to] {
                if let Some((table, field)) = endpoint.split_once('.') {
                    if table == table_name {
                        push(field);
                    }
                }
            }
        }

        fields
    }
}

pub struct QueryContextBuilder<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    store: &'a dyn MetadataStore,
    task_id: Id,
}

impl<'a> QueryContextBuilder<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        options: ChatOptions,
        store: &'a dyn MetadataStore,
        task_id: Id,
    ) -> Self {
        Self { chat, options, store, task_id }
    }

    pub async fn build(&self, question: &str, table_names: &[String]) -> Result<QueryContext> {
        let prompt = self.build_prompt(question, table_names).await?;
        let reply = self
            .chat
            .chat(
                &[
                    ChatMessage::system("你是一个查询上下文分析器，严格按行协议返回。"),
                    ChatMessage::user(prompt),
                ],
                self.options.capped(4096),
            )
            .await?;
        let context = parse_line_protocol(&reply);
        debug!(
            "query context: {} allowed tables, {} joins, {} usage entries",
            context.allowed_tables.len(),
            context.joins.len(),
            context.table_usage.len()
        );
        Ok(context)
    }

    async fn build_prompt(&self, question: &str, table_names: &[String]) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        parts.push("=".repeat(50));
        parts.push(
            "\n你是一个 Query Context 构建器 🧠。\n\n\
             你的任务是：\n\
             - 根据【用户问题】和【已知表信息】，构建一次查询所需的 Query Context。\n\
             - 明确字段是用于 WHERE 过滤，还是用于 GROUP BY 分组。\n\n\
             你【不能】：\n\
             - 生成 SQL\n\
             - 推断或发明字段含义\n\
             - 添加未提供的表或 JOIN 关系\n\n\
             你【必须】：\n\
             - 严格使用给定的表和 JOIN 事实\n\
             - 只做\"字段用途分类\"，不做 SQL 设计\n\
             - 输出必须严格符合下面定义的【行协议】\n\n\
             ────────────────\n\
             🎯 核心目标\n\
             ────────────────\n\
             为后续 SQL 生成阶段提供【严格、不可歧义】的上下文约束。"
                .to_string(),
        );

        parts.push("\n\n已选择的数据库表详细信息：".to_string());
        parts.push("=".repeat(50));

        for table_name in table_names {
            parts.push(format!("\n📋 表：{}", table_name));
            let Some(table) = self.store.get_table_context(self.task_id, table_name).await? else {
                continue;
            };
            if let Some(description) = &table.description {
                if !description.is_empty() {
                    parts.push(format!("表描述：{}", description));
                }
            }

            let fields = self.store.list_field_contexts(self.task_id, table.id).await?;
            if !fields.is_empty() {
                parts.push("\n字段信息：".to_string());
                for field in &fields {
                    let mut line_parts: Vec<String> = Vec::new();
                    line_parts.push(format!(
                        "{}({})",
                        field.field_name,
                        field.field_type.as_deref().unwrap_or("unknown")
                    ));
                    if let Some(sample) = first_sample_value(field.sample_values.as_deref()) {
                        line_parts.push(format!("样例:{}", sample));
                    }
                    if let Some(null_rate) = field.null_rate {
                        line_parts.push(format!("空值率:{:.2}%", null_rate * 100.0));
                    }
                    if let Some(unique_count) = field.unique_count {
                        line_parts.push(format!("唯一值:{}", unique_count));
                    }
                    if let Some(meaning) = field.business_meaning.as_deref() {
                        if !meaning.is_empty() {
                            line_parts.push(format!("业务:{}", meaning));
                        }
                    }
                    if let Some(description) = field.description.as_deref() {
                        if !description.is_empty() {
                            line_parts.push(format!("说明:{}", description));
                        }
                    }
                    parts.push(format!("  • {}", line_parts.join(" | ")));
                }
            }
        }

        parts.push("\n\n表之间的关联关系（JOIN 事实）：".to_string());
        let relations = self.store.list_relations(self.task_id, table_names).await?;
        if relations.is_empty() {
            parts.push("(暂无关联关系信息)".to_string());
        } else {
            for relation in &relations {
                parts.push(format!(
                    "{}.{} -> {}.{}",
                    relation.source_table, relation.source_field, relation.target_table, relation.target_field
                ));
            }
        }

        parts.push("\n".to_string() + &"=".repeat(50));
        parts.push(format!("用户输入: {}", question));

        parts.push(
            "\n────────────────\n\
             ⚠️ 强约束输出格式（行协议）\n\
             ────────────────\n\n\
             【行协议规则】\n\
             - 每行一个 KEY=VALUE\n\
             - KEY 必须全部大写\n\
             - 多个值使用英文逗号分隔\n\
             - JOIN 使用 table.column->table.column\n\
             - 如果某一项不存在，可以不输出该行\n\
             - 严禁输出任何解释性文字或多余内容\n\n\
             允许的 KEY（只能使用这些）：\n\
             - ALLOWED_TABLES\n\
             - DRIVER_TABLE\n\
             - JOIN\n\
             - TABLE_USAGE.<table>.WHERE_FIELDS\n\
             - TABLE_USAGE.<table>.GROUP_BY_FIELDS\n\
             - TABLE_USAGE.<table>.AGG_FIELDS\n\
             - TABLE_USAGE.<table>.JOIN_KEY\n\n\
             ────────────────\n\
             🚨 字段用途强制规则（必须遵守）\n\
             ────────────────\n\
             ❗ 1. WHERE_FIELDS：\n\
                - 只包含用于条件过滤的字段\n\
                - 必须与用户问题中的筛选条件一一对应\n\n\
             ❗ 2. GROUP_BY_FIELDS：\n\
                - 只包含用于分组维度的字段\n\
                - 如果用户问题出现\"按…统计 / 按…分组 / 各…情况\"等表达，必须提取对应字段\n\n\
             ❗ 3. AGG_FIELDS：\n\
                - 只包含需要被聚合的字段（如计数、求和等）\n\
                - 如果用户问题没有明确聚合需求，可以不输出\n\n\
             ❗ 4. 同一个字段不能同时出现在 WHERE_FIELDS 和 GROUP_BY_FIELDS 中\n\
             ❗ 5. 只允许使用已提供的表和字段\n\n\
             ────────────────\n\
             📌 输出示例（格式示例，不是业务示例）\n\
             ────────────────\n\n\
             ALLOWED_TABLES=AAA,BBB,CCC\n\
             DRIVER_TABLE=AAA\n\n\
             JOIN=BBB.person_id->AAA.person_id\n\
             JOIN=CCC.person_id->AAA.person_id\n\n\
             TABLE_USAGE.AAA.WHERE_FIELDS=rank,start_date\n\
             TABLE_USAGE.AAA.GROUP_BY_FIELDS=department\n\
             TABLE_USAGE.AAA.JOIN_KEY=person_id\n\n\
             TABLE_USAGE.BBB.WHERE_FIELDS=nationality\n\
             TABLE_USAGE.BBB.JOIN_KEY=person_id\n\n\
             TABLE_USAGE.CCC.GROUP_BY_FIELDS=position\n\
             TABLE_USAGE.CCC.AGG_FIELDS=incumbency\n\
             TABLE_USAGE.CCC.JOIN_KEY=person_id\n\n\
             ────────────────\n\
             请严格按照上述行协议输出 Query Context。"
                .to_string(),
        );

        Ok(parts.join("\n"))
    }
}

/// One sample value, truncated, from the stored JSON array (or raw string).
fn first_sample_value(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items.first().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })?,
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => raw.to_string(),
    };
    Some(value.chars().take(100).collect())
}

/// Parses the line protocol. Lenient by design: comments, malformed lines and
/// unrecognized keys are skipped, and whatever accumulates from parseable
/// lines is returned. No retries.
///
/// The WHERE/GROUP-BY exclusion rule is a prompt-side instruction only; output
/// violating it is passed through unchanged.
pub fn parse_line_protocol(content: &str) -> QueryContext {
    let usage_key = Regex::new(r"^TABLE_USAGE\.([^.]+)\.([A-Z_]+)$").unwrap();
    let mut context = QueryContext::default();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim();

        match key {
            "ALLOWED_TABLES" => {
                context.allowed_tables = split_list(value);
            }
            "DRIVER_TABLE" => {
                context.driver_table = Some(value.to_string());
            }
            "JOIN" => {
                if let Some((from, to)) = value.split_once("->") {
                    context
                        .joins
                        .push(Join { from: from.trim().to_string(), to: to.trim().to_string() });
                }
            }
            _ => {
                let Some(caps) = usage_key.captures(key) else { continue };
                let table = caps[1].to_string();
                let usage = context.table_usage.entry(table).or_default();
                match &caps[2] {
                    "WHERE_FIELDS" => usage.filter_fields = split_list(value),
                    "GROUP_BY_FIELDS" => usage.group_by_fields = split_list(value),
                    "AGG_FIELDS" => usage.agg_fields = split_list(value),
                    "JOIN_KEY" => usage.join_key = Some(value.to_string()),
                    _ => {}
                }
            }
        }
    }

    context
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_protocol() {
        let reply = "\
ALLOWED_TABLES=orders,users
DRIVER_TABLE=orders

JOIN=users.id->orders.user_id

TABLE_USAGE.orders.WHERE_FIELDS=status, region
TABLE_USAGE.orders.AGG_FIELDS=amount
TABLE_USAGE.orders.JOIN_KEY=user_id
TABLE_USAGE.users.GROUP_BY_FIELDS=city";
        let context = parse_line_protocol(reply);
        assert_eq!(context.allowed_tables, vec!["orders", "users"]);
        assert_eq!(context.driver_table.as_deref(), Some("orders"));
        assert_eq!(context.joins.len(), 1);
        assert_eq!(context.joins[0].from, "users.id");
        assert_eq!(context.table_usage["orders"].filter_fields, vec!["status", "region"]);
        assert_eq!(context.table_usage["orders"].agg_fields, vec!["amount"]);
        assert_eq!(context.table_usage["orders"].join_key.as_deref(), Some("user_id"));
        assert_eq!(context.table_usage["users"].group_by_fields, vec!["city"]);
        assert!(context.table_usage["users"].filter_fields.is_empty());
    }

    #[test]
    fn unknown_keys_and_malformed_lines_are_skipped() {
        let reply = "\
# comment line
ALLOWED_TABLES=orders
SOME_FUTURE_KEY=whatever
TABLE_USAGE.orders.SORT_FIELDS=created_at
JOIN=broken join without arrow
not a key value line at all
TABLE_USAGE.orders.WHERE_FIELDS=status";
        let context = parse_line_protocol(reply);
        assert_eq!(context.allowed_tables, vec!["orders"]);
        assert!(context.joins.is_empty());
        assert_eq!(context.table_usage["orders"].filter_fields, vec!["status"]);
        assert!(context.table_usage["orders"].group_by_fields.is_empty());
    }

    // The exclusion rule between WHERE_FIELDS and GROUP_BY_FIELDS is enforced
    // in the prompt, not here: output violating it is passed through as-is.
    #[test]
    fn double_duty_fields_are_passed_through() {
        let reply = "\
TABLE_USAGE.orders.WHERE_FIELDS=status,region
TABLE_USAGE.orders.GROUP_BY_FIELDS=region";
        let context = parse_line_protocol(reply);
        let usage = &context.table_usage["orders"];
        assert_eq!(usage.filter_fields, vec!["status", "region"]);
        assert_eq!(usage.group_by_fields, vec!["region"]);
    }

    #[test]
    fn empty_reply_yields_empty_context() {
        let context = parse_line_protocol("抱歉，我理解不了这个问题。");
        assert!(context.is_empty());
    }

    #[test]
    fn relevant_fields_cover_usages_and_join_endpoints() {
        let reply = "\
ALLOWED_TABLES=orders,users
JOIN=users.id->orders.user_id
TABLE_USAGE.orders.WHERE_FIELDS=status
TABLE_USAGE.orders.GROUP_BY_FIELDS=region
TABLE_USAGE.orders.AGG_FIELDS=amount
TABLE_USAGE.orders.JOIN_KEY=user_id";
        let context = parse_line_protocol(reply);
        let fields = context.relevant_fields("orders");
        assert_eq!(fields, vec!["status", "region", "amount", "user_id"]);
        assert_eq!(context.relevant_fields("users"), vec!["id"]);
    }

    #[test]
    fn first_sample_value_handles_arrays_and_raw_strings() {
        assert_eq!(first_sample_value(Some("[\"2025-12-06\", \"2025-12-07\"]")).unwrap(), "2025-12-06");
        assert_eq!(first_sample_value(Some("plain")).unwrap(), "plain");
        assert_eq!(first_sample_value(Some("[3, 4]")).unwrap(), "3");
        assert!(first_sample_value(Some("")).is_none());
        assert!(first_sample_value(None).is_none());
    }
}
