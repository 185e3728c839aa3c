//! WHERE-clause refinement: derives a per-table filter predicate from the
//! query context and field rules, injected before final SQL generation.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::agents::context::QueryContext;
use crate::error::Result;
use crate::executor::Dialect;
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::store::{Id, MetadataStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnPatch {
    #[serde(rename = "where")]
    pub where_clause: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchOutcome {
    pub column_patches: BTreeMap<String, ColumnPatch>,
    pub tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct ColumnPatcher<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    store: &'a dyn MetadataStore,
    task_id: Id,
    dialect: Dialect,
}

impl<'a> ColumnPatcher<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        options: ChatOptions,
        store: &'a dyn MetadataStore,
        task_id: Id,
        dialect: Dialect,
    ) -> Self {
        Self { chat, options, store, task_id, dialect }
    }

    /// Only tables whose context actually lists filter fields qualify; with
    /// none, the stage is skipped entirely.
    pub async fn patch(
        &self,
        question: &str,
        query_context: &QueryContext,
        table_names: &[String],
    ) -> Result<PatchOutcome> {
        let filtered = filter_tables_by_fields(query_context, table_names);
        if filtered.is_empty() {
            return Ok(PatchOutcome {
                column_patches: BTreeMap::new(),
                tables: Vec::new(),
                reason: Some("没有找到需要过滤的表或字段".to_string()),
            });
        }

        let prompt = self.build_prompt(question, query_context, &filtered).await?;
        let reply = self
            .chat
            .chat(
                &[
                    ChatMessage::system("你是SQL WHERE条件生成专家。仅输出每表WHERE和原因。"),
                    ChatMessage::user(prompt),
                ],
                self.options.capped(4096),
            )
            .await?;

        let column_patches = parse_block_protocol(&reply);
        debug!("column patcher produced {} patches", column_patches.len());
        Ok(PatchOutcome {
            column_patches,
            tables: filtered.iter().map(|(table, _)| table.clone()).collect(),
            reason: None,
        })
    }

    async fn build_prompt(
        &self,
        question: &str,
        query_context: &QueryContext,
        filtered: &[(String, Vec<String>)],
    ) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        parts.push(
            "你是一个【SQL WHERE 条件生成器】🧠，只负责生成 WHERE 条件。\n\n\
             🎯 任务目标：\n\
             - 根据【用户查询意图】和【RULE 规则】，为【每一个表】分别生成 WHERE 条件。\n\
             - 所有 WHERE 条件必须严格遵守 RULE，禁止自行推断或发挥。\n\n\
             ────────────────\n\
             🚨 强制规则（必须 100% 遵守）\n\
             ────────────────\n\
             ❗ 1. 每个表【必须单独输出一段】，禁止多个表合并到同一个 WHERE\n\
             ❗ 2. 每段 WHERE【只能使用当前表的字段】，严禁跨表字段\n\
             ❗ 3. 只允许输出 WHERE 子句，禁止输出 SELECT / JOIN / 解释性文字\n\
             ❗ 4. WHERE 中使用的值【必须来源于用户问题】，禁止编造，推断或假设\n\
             ❗ 5. 凡 RULE 中涉及【简繁体 / 数字汉字泛化】的要求，无论对象是人名、地名还是组织名，都必须执行\n\
             ❗ 6. 必须检查并使用所有适用的 RULE，禁止忽略 RULE\n\n\
             ────────────────\n\
             📐 输出格式（格式即协议）\n\
             ────────────────\n\
             ✅ 每个表单独一段，段与段之间必须空一行\n\
             ✅ 严格使用以下格式，不允许多字或少字：\n\n\
             [TABLE] 表名\n\
             WHERE 条件\n\
             REASON: 使用了哪些 RULE\n\n\
             ────────────────\n\
             🛑 兜底规则\n\
             ────────────────\n\
             ⚠️ 如果无法为某个表生成合法 WHERE 条件，必须输出：\n\n\
             [TABLE] 表名\n\
             WHERE 1=1\n\
             REASON: 无可用字段或不满足 RULE\n\n\
             ────────────────\n\
             📌 再次强调\n\
             ────────────────\n\
             - 表与表之间【完全独立】❌ 不允许共享 WHERE\n\
             - WHERE 中不允许出现不属于该表的字段\n\
             - 不允许遗漏任何适用的 RULE"
                .to_string(),
        );

        parts.push(format!("\n═ 用户问题 ═\n{}", question));

        if !query_context.table_usage.is_empty() {
            parts.push("\n═ 表使用信息 ═".to_string());
            for (table_name, _) in filtered {
                let Some(usage) = query_context.table_usage.get(table_name) else { continue };
                parts.push(format!("\n▶ 表：{}", table_name));
                if !usage.filter_fields.is_empty() {
                    parts.push(format!("  过滤字段：{}", usage.filter_fields.join(", ")));
                }
                if !usage.group_by_fields.is_empty() {
                    parts.push(format!("  分组字段：{}", usage.group_by_fields.join(", ")));
                }
            }
        }

        parts.push("\n═ 字段详细信息 ═".to_string());
        for (table_name, filter_fields) in filtered {
            let Some(table) = self.store.get_table_context(self.task_id, table_name).await? else {
                continue;
            };
            parts.push(format!("\n📋 表：{}", table_name));
            parts.push("─".repeat(40));

            let fields = self.store.list_field_contexts(self.task_id, table.id).await?;
            let mut rendered = 0;
            for field in &fields {
                if !filter_fields.contains(&field.field_name) {
                    continue;
                }
                if rendered >= 5 {
                    break;
                }
                rendered += 1;
                parts.push(format!("\n🔹 字段：{}", field.field_name));
                if let Some(meaning) = field.business_meaning.as_deref() {
                    if !meaning.is_empty() {
                        parts.push(format!("  业务含义：{}", meaning));
                    }
                }
                if let Some(format) = field.data_format.as_deref() {
                    if !format.is_empty() {
                        parts.push(format!("  数据格式：{}", format));
                    }
                }
                if let Some(description) = field.description.as_deref() {
                    if !description.is_empty() {
                        parts.push(format!("  字段描述：{}", description));
                    }
                }
                if !field.query_scenarios.is_empty() {
                    parts.push("  查询场景：".to_string());
                    for scenario in field.query_scenarios.iter().take(3) {
                        parts.push(format!("    • {}", scenario));
                    }
                }
                if !field.rules.is_empty() {
                    parts.push("  规则：".to_string());
                    for rule in field.rules.iter().take(3) {
                        parts.push(format!("    - {}", rule));
                    }
                }
            }
        }

        parts.push(format!(
            "\n═ 数据库类型 ═\n数据库类型：{}{}",
            self.dialect.label(),
            dialect_where_hint(self.dialect).unwrap_or("")
        ));

        parts.push("\n请根据上述信息，为每个表生成 WHERE 条件。".to_string());
        parts.push("记住：严格遵守输出格式要求！".to_string());
        Ok(parts.join("\n"))
    }
}

/// Tables that actually have filter fields in the query context, in the
/// caller's order.
fn filter_tables_by_fields(
    query_context: &QueryContext,
    table_names: &[String],
) -> Vec<(String, Vec<String>)> {
    table_names
        .iter()
        .filter_map(|table_name| {
            let usage = query_context.table_usage.get(table_name)?;
            if usage.filter_fields.is_empty() {
                None
            } else {
                Some((table_name.clone(), usage.filter_fields.clone()))
            }
        })
        .collect()
}

fn dialect_where_hint(dialect: Dialect) -> Option<&'static str> {
    match dialect {
        Dialect::MySql => {
            Some("（MySQL提示：字符串比较使用 LIKE 或 =，注意字符集；日期使用 BETWEEN；NULL使用 IS NULL）")
        }
        Dialect::Postgres => {
            Some("（PostgreSQL提示：字符串区分大小写，可使用 ILIKE 进行不区分大小写匹配；支持 >、BETWEEN 等）")
        }
        Dialect::Oracle => {
            Some("（Oracle提示：字符串默认不区分大小写；日期使用 TO_DATE 函数；空字符串视为 NULL）")
        }
        Dialect::SqlServer => {
            Some("（SQL Server提示：字符串比较可能不区分大小写；日期使用 BETWEEN；NULL使用 IS NULL）")
        }
        Dialect::ClickHouse | Dialect::Unknown => None,
    }
}

/// Line state machine over the `[TABLE]` / `WHERE` / `REASON:` block
/// protocol: a `[TABLE]` line flushes the previous table, end-of-input
/// flushes the last; a repeated `WHERE` wins; missing clauses fall back to
/// `WHERE 1=1` / `无规则`.
pub fn parse_block_protocol(content: &str) -> BTreeMap<String, ColumnPatch> {
    let mut patches = BTreeMap::new();
    let mut current_table: Option<String> = None;
    let mut current_where: Option<String> = None;
    let mut current_reason: Option<String> = None;

    let flush = |table: &mut Option<String>,
                 where_clause: &mut Option<String>,
                 reason: &mut Option<String>,
                 patches: &mut BTreeMap<String, ColumnPatch>| {
        if let Some(table) = table.take() {
            patches.insert(
                table,
                ColumnPatch {
                    where_clause: where_clause.take().unwrap_or_else(|| "WHERE 1=1".to_string()),
                    reason: reason.take().unwrap_or_else(|| "无规则".to_string()),
                },
            );
        }
    };

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("[TABLE]") {
            flush(&mut current_table, &mut current_where, &mut current_reason, &mut patches);
            current_table = Some(rest.trim().to_string());
            continue;
        }
        if line.starts_with("WHERE") {
            current_where = Some(line.to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("REASON:") {
            current_reason = Some(rest.trim().to_string());
        }
    }
    flush(&mut current_table, &mut current_where, &mut current_reason, &mut patches);

    patches
}
