//! Final SQL generation: folds DDL, samples, semantic profiles, the query
//! context, and column patches into one dialect-aware prompt and extracts a
//! single statement plus its rationale.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::agents::context::QueryContext;
use crate::agents::patcher::PatchOutcome;
use crate::error::Result;
use crate::executor::Dialect;
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::parse::{extract_fenced_sql, section_between};
use crate::store::{Id, MetadataStore, TableContext};

const DDL_PREVIEW_CHARS: usize = 500;
const SAMPLE_VALUE_CHARS: usize = 200;
const MAX_RELEVANT_FIELDS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub reason: String,
    pub database_type: String,
    pub table_level_info: Value,
    pub field_level_info: Value,
}

pub struct SqlGenerator<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    store: &'a dyn MetadataStore,
    task_id: Id,
    dialect: Dialect,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        options: ChatOptions,
        store: &'a dyn MetadataStore,
        task_id: Id,
        dialect: Dialect,
    ) -> Self {
        Self { chat, options, store, task_id, dialect }
    }

    /// An empty `sql` in the result is valid; the caller must check before
    /// executing.
    pub async fn generate(
        &self,
        question: &str,
        query_context: &QueryContext,
        column_patches: &PatchOutcome,
        selected_tables: &[String],
    ) -> Result<GeneratedSql> {
        let mut contexts: Vec<TableContext> = Vec::new();
        for table_name in selected_tables {
            if let Some(context) = self.store.get_table_context(self.task_id, table_name).await? {
                contexts.push(context);
            }
        }

        let table_level_info = table_level_info(&contexts);
        let field_level_info = self.field_level_info(&contexts, query_context).await?;

        let prompt = self
            .build_prompt(
                question,
                query_context,
                column_patches,
                selected_tables,
                &contexts,
                &field_level_info,
            )
            .await?;

        let reply = self
            .chat
            .chat(
                &[
                    ChatMessage::system("你是SQL生成专家。请按格式返回【SQL】和【理由】。"),
                    ChatMessage::user(prompt),
                ],
                self.options.capped(4096),
            )
            .await?;

        let (sql, reason) = parse_sql_response(&reply);
        debug!("sql generator produced {} chars of SQL", sql.len());
        Ok(GeneratedSql {
            sql,
            reason,
            database_type: self.dialect.label().to_string(),
            table_level_info,
            field_level_info,
        })
    }

    /// Field semantics narrowed to the fields the query context flags for
    /// each table, keeping the prompt bounded. Tables with no flagged fields
    /// fall back to their first profiled fields.
    async fn field_level_info(
        &self,
        contexts: &[TableContext],
        query_context: &QueryContext,
    ) -> Result<Value> {
        let mut info = serde_json::Map::new();
        for table in contexts {
            let fields = self.store.list_field_contexts(self.task_id, table.id).await?;
            let relevant = query_context.relevant_fields(&table.table_name);

            let mut table_fields = serde_json::Map::new();
            let selected: Vec<_> = if relevant.is_empty() {
                fields
                    .iter()
                    .filter(|f| f.business_meaning.is_some() || f.description.is_some())
                    .take(5)
                    .collect()
            } else {
                fields
                    .iter()
                    .filter(|f| relevant.contains(&f.field_name))
                    .take(MAX_RELEVANT_FIELDS)
                    .collect()
            };

            for field in selected {
                table_fields.insert(
                    field.field_name.clone(),
                    json!({
                        "business_meaning": field.business_meaning,
                        "data_format": field.data_format,
                        "field_description": field.description,
                        "field_type": field.field_type,
                        "null_rate": field.null_rate,
                        "unique_count": field.unique_count,
                        "sample_data": field.sample_values,
                    }),
                );
            }
            info.insert(table.table_name.clone(), Value::Object(table_fields));
        }
        Ok(Value::Object(info))
    }

    async fn build_prompt(
        &self,
        question: &str,
        query_context: &QueryContext,
        column_patches: &PatchOutcome,
        selected_tables: &[String],
        contexts: &[TableContext],
        field_level_info: &Value,
    ) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();

        parts.push(dialect_system_prompt(self.dialect).to_string());

        parts.push("选择的表：".to_string());
        parts.push("=".repeat(50));
        parts.push(format!("数据库类型: {}", self.dialect.label()));
        if !query_context.is_empty() {
            parts.push(format!(
                "查询上下文: {}",
                serde_json::to_string(query_context).unwrap_or_default()
            ));
        }
        if !column_patches.column_patches.is_empty() {
            parts.push(format!(
                "列补丁: {}",
                serde_json::to_string(column_patches).unwrap_or_default()
            ));
        }

        parts.push("数据库表详细信息：".to_string());
        parts.push("=".repeat(50));
        for table in contexts {
            parts.push(format!("\n表: {}", table.table_name));
            parts.push("-".repeat(50));

            if let Some(description) = table.description.as_deref() {
                if !description.is_empty() {
                    parts.push(format!("\n表描述: {}", description));
                }
            }
            if !table.query_scenarios.is_empty() {
                parts.push("\n查询场景:".to_string());
                for scenario in table.query_scenarios.iter().take(3) {
                    parts.push(format!("  • {}", scenario));
                }
            }
            if !table.aggregation_scenarios.is_empty() {
                parts.push("\n聚合场景:".to_string());
                for scenario in table.aggregation_scenarios.iter().take(3) {
                    parts.push(format!("  • {}", scenario));
                }
            }

            if let Some(ddl) = table.ddl.as_deref() {
                if !ddl.is_empty() {
                    parts.push(format!("\n表结构(DDL):\n{}", truncate(ddl, DDL_PREVIEW_CHARS)));
                }
            }

            if !table.sample_rows.is_empty() {
                parts.push("\n样例数据:".to_string());
                for (index, sample) in table.sample_rows.iter().take(2).enumerate() {
                    parts.push(format!("  样例{}: {}", index + 1, render_sample(sample)));
                }
            }

            if let Some(fields) = field_level_info.get(&table.table_name).and_then(|v| v.as_object()) {
                if !fields.is_empty() {
                    parts.push("\n相关字段信息:".to_string());
                    for (count, (field_name, data)) in fields.iter().enumerate() {
                        parts.push(format!("\n  {}. 字段: {}", count + 1, field_name));
                        let text_items = [
                            ("business_meaning", "业务含义"),
                            ("field_description", "字段描述"),
                            ("data_format", "数据格式"),
                            ("field_type", "字段类型"),
                            ("sample_data", "示例值"),
                        ];
                        for (key, title) in text_items {
                            if let Some(value) = data.get(key).and_then(|v| v.as_str()) {
                                if !value.is_empty() {
                                    parts.push(format!("     {}: {}", title, truncate(value, 100)));
                                }
                            }
                        }
                        if let Some(null_rate) = data.get("null_rate").and_then(|v| v.as_f64()) {
                            parts.push(format!("     空值率: {}%", null_rate * 100.0));
                        }
                        if let Some(unique) = data.get("unique_count").and_then(|v| v.as_i64()) {
                            parts.push(format!("     唯一值数: {}", unique));
                        }
                    }
                }
            }
            parts.push(String::new());
        }

        parts.push("\n".to_string() + &"=".repeat(50));
        parts.push("表的关联关系：".to_string());
        parts.push(self.relationship_section(selected_tables).await?);

        parts.push("\n".to_string() + &"=".repeat(50));
        parts.push("创建sql的规则：".to_string());
        parts.push(join_order_section(contexts));

        parts.push("\n".to_string() + &"=".repeat(50));
        parts.push(format!("用户输入: {}", question));
        parts.push("请根据上述数据库表结构和规则，生成对应的SQL查询语句。".to_string());

        let database_type = self.dialect.label();
        parts.push(format!(
            "\n【输出要求 - 必须严格遵守】\n\
             1. 只能按照以下格式返回，不允许有任何多余内容\n\
             2. SQL 必须是 {database_type} 数据库可直接执行的 SQL，严格遵循该数据库的语法规范\n\
             3. SQL 只能出现一次\n\
             4. 理由必须是条目化说明，说明每个关键设计点\n\n\
             【返回格式示例】\n\n\
             【SQL】\n\
             SELECT ...\n\
             FROM ...\n\
             WHERE ...\n\
             GROUP BY ...\n\n\
             【理由】\n\
             1. 选择 xxx 表是因为 ...\n\
             2. 不选择 yyy 表是因为 ...\n\
             3. 使用 xxx 字段作为过滤条件是因为 ...\n\
             4. 选择了符合 {database_type} 数据库特性的优化方式\n\
             5. 选择了关联字段 xxx 和 yyy 进行连接是因为"
        ));

        Ok(parts.join("\n"))
    }

    /// Stored relations between the selected tables ground the JOINs; with
    /// none stored the model is told to infer from field names instead.
    async fn relationship_section(&self, selected_tables: &[String]) -> Result<String> {
        if selected_tables.is_empty() {
            return Ok("未指定表名，无法获取表关系信息。".to_string());
        }
        let relations = self.store.list_relations(self.task_id, selected_tables).await?;
        if relations.is_empty() {
            return Ok("未找到表之间的关联关系，请根据字段名推断可能的JOIN条件。".to_string());
        }

        let mut parts: Vec<String> = Vec::new();
        parts.push("表之间的关联关系（JOIN 信息）：".to_string());
        parts.push("=".repeat(50));
        for (index, relation) in relations.iter().enumerate() {
            parts.push(format!("\n{}. {} -> {}", index + 1, relation.source_table, relation.target_table));
            parts.push(format!(
                "   关联字段: {}.{} = {}.{}",
                relation.source_table, relation.source_field, relation.target_table, relation.target_field
            ));
            parts.push(format!("   关联类型: {}", relation.relation_type));
            if let Some(description) = relation.description.as_deref() {
                if !description.is_empty() {
                    parts.push(format!("   说明: {}", description));
                }
            }
        }
        parts.push(format!("\n{}", "=".repeat(50)));
        parts.push("JOIN 使用建议：".to_string());
        parts.push("1. 使用上述明确的关联字段进行 JOIN".to_string());
        parts.push("2. 注意 JOIN 的顺序，考虑表的大小以提高性能".to_string());
        parts.push("3. 确保关联字段上有适当的索引".to_string());
        Ok(parts.join("\n"))
    }
}

fn dialect_system_prompt(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "你是一个专业的 MySQL 数据库助手，擅长根据用户需求生成高效的 MySQL 查询语句。\n\
             特别注意 MySQL 的语法特性：\n\
             - 使用 LIMIT 而不是 TOP 来限制结果\n\
             - 日期时间函数使用 NOW(), CURDATE()\n\
             - 字符串连接使用 CONCAT() 函数\n\
             - GROUP BY 需要包含 SELECT 中的非聚合列"
        }
        Dialect::Postgres => {
            "你是一个专业的 PostgreSQL 数据库助手，擅长根据用户需求生成高效的 PostgreSQL 查询语句。\n\
             特别注意 PostgreSQL 的语法特性：\n\
             - 支持丰富的窗口函数如 ROW_NUMBER(), RANK(), DENSE_RANK()\n\
             - 字符串连接使用 || 操作符\n\
             - 可以使用 ILIKE 进行不区分大小写的模糊匹配\n\
             - 支持数组类型和相关的操作符"
        }
        Dialect::Oracle => {
            "你是一个专业的 Oracle 数据库助手，擅长根据用户需求生成高效的 Oracle 查询语句。\n\
             特别注意 Oracle 的语法特性：\n\
             - 使用 ROWNUM 来限制结果数量\n\
             - 日期需要使用 TO_DATE 函数转换\n\
             - 字符串连接使用 || 操作符\n\
             - 空字符串被视为 NULL"
        }
        Dialect::SqlServer => {
            "你是一个专业的 SQL Server 数据库助手，擅长根据用户需求生成高效的 SQL Server 查询语句。\n\
             特别注意 SQL Server 的语法特性：\n\
             - 使用 TOP N 来限制结果数量\n\
             - 支持 WITH 语句创建公用表表达式(CTE)\n\
             - 日期时间函数使用 GETDATE()\n\
             - 可以使用 CONCAT() 函数连接字符串"
        }
        Dialect::ClickHouse => {
            "你是一个专业的 ClickHouse 数据库助手，擅长根据用户需求生成高效的 ClickHouse 查询语句。\n\
             特别注意 ClickHouse 的语法特性：\n\
             - 高性能分析型数据库，适合大数据量的聚合查询\n\
             - 支持 groupArray, groupUniqArray 等数组聚合函数\n\
             - 支持 ANY, ALL 等特殊操作符\n\
             - 日期处理函数丰富，如 today(), yesterday()"
        }
        Dialect::Unknown => {
            "你是一个专业的数据库助手，擅长根据用户需求生成高效的查询语句。\n\
             请使用标准 SQL 语法生成查询语句。"
        }
    }
}

fn table_level_info(contexts: &[TableContext]) -> Value {
    let mut info = serde_json::Map::new();
    for table in contexts {
        info.insert(
            table.table_name.clone(),
            json!({
                "table_description": table.description,
                "query_scenarios": table.query_scenarios,
                "aggregation_scenarios": table.aggregation_scenarios,
                "data_role": table.data_role,
                "usage_not_scenarios": table.usage_not_scenarios,
            }),
        );
    }
    Value::Object(info)
}

fn join_order_section(contexts: &[TableContext]) -> String {
    let mut sizes: Vec<(&str, Option<i64>)> =
        contexts.iter().map(|t| (t.table_name.as_str(), t.row_count)).collect();
    sizes.sort_by_key(|(_, count)| count.unwrap_or(i64::MAX));

    let mut parts: Vec<String> = Vec::new();
    parts.push("\n1. 表大小信息（行数）:".to_string());
    for (table_name, row_count) in sizes.iter().take(5) {
        let count = row_count.map_or_else(|| "未知".to_string(), |n| n.to_string());
        parts.push(format!("   {}: {}", table_name, count));
    }
    parts.push("\n2. JOIN优化规则:".to_string());
    parts.push("   - 优先使用大表作为驱动表".to_string());
    parts.push("   - JOIN顺序：大表 -> 小表".to_string());
    parts.push("   - 确保JOIN字段上有索引".to_string());
    parts.push("\n3. SQL生成规则:".to_string());
    parts.push("   - 只使用已明确提及的字段".to_string());
    parts.push("   - 避免不必要的子查询".to_string());
    parts.push("   - 使用WHERE而不是HAVING进行过滤".to_string());
    parts.push("   - 聚合时注意NULL值处理".to_string());
    parts.join("\n")
}

fn render_sample(sample: &Value) -> String {
    match sample {
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    format!("{}: {}", key, truncate(&text, SAMPLE_VALUE_CHARS))
                })
                .collect();
            format!("\n    {}", items.join("\n    "))
        }
        Value::String(s) => truncate(s, SAMPLE_VALUE_CHARS),
        other => truncate(&other.to_string(), SAMPLE_VALUE_CHARS),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

/// Marker-delimited extraction of the 【SQL】/【理由】 sections, with a fenced
/// code block as fallback when the SQL marker is missing.
pub fn parse_sql_response(reply: &str) -> (String, String) {
    let sql = section_between(reply, "【SQL】", &["【理由】"]).unwrap_or_default();
    let reason = section_between(reply, "【理由】", &[]).unwrap_or_default();

    let sql = if sql.is_empty() {
        extract_fenced_sql(reply).unwrap_or_default()
    } else {
        sql
    };

    (sql, reason)
}
