//! Few-shot SQL matching: finds the closest historical (question, SQL) pair
//! and adapts its SQL to the new question, scored 0-100. Also the reverse
//! direction: harvesting a confirmed pair back into the example library.

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::llm::{ChatApi, ChatMessage, ChatOptions};
use crate::parse::{clean_sql, extract_fenced_sql, parse_json_flexible, section_between};
use crate::store::{QaExample, WhereCondition};

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub sql: String,
    pub similarity: u8,
}

/// Matcher over the task's enabled example library. Keeps the running message
/// history so follow-up calls within one request share context.
pub struct SimilarityMatcher<'a> {
    chat: &'a dyn ChatApi,
    options: ChatOptions,
    history: Vec<ChatMessage>,
}

impl<'a> SimilarityMatcher<'a> {
    pub fn new(chat: &'a dyn ChatApi, options: ChatOptions) -> Self {
        Self { chat, options, history: Vec::new() }
    }

    /// Returns the adapted SQL and similarity score. An empty or unusable
    /// example library short-circuits to `("", 0)` without an LLM call so the
    /// caller falls through to the full selection pipeline.
    pub async fn match_sql(&mut self, question: &str, examples: &[QaExample]) -> Result<MatchOutcome> {
        let Some(prompt) = build_shot_prompt(question, examples) else {
            return Ok(MatchOutcome { sql: String::new(), similarity: 0 });
        };

        let reply = self.send(prompt).await?;
        let sql = extract_sql_from_template(&reply);
        let similarity = extract_similarity(&reply);
        debug!("similarity matcher scored {} over {} examples", similarity, examples.len());
        Ok(MatchOutcome { sql, similarity })
    }

    async fn send(&mut self, content: String) -> Result<String> {
        self.history.push(ChatMessage::user(content));
        let reply = self.chat.chat(&self.history, self.options).await?;
        self.history.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }
}

fn build_shot_prompt(question: &str, examples: &[QaExample]) -> Option<String> {
    let shots: Vec<&QaExample> = examples
        .iter()
        .filter(|example| !example.question.trim().is_empty() && !example.sql.trim().is_empty())
        .collect();
    if shots.is_empty() {
        return None;
    }

    let mut parts: Vec<String> = Vec::new();
    parts.push(
        "🎯 你是一个 SQL 查询匹配专家\n\n\
         任务：分析用户的问题，从提供的示例中找到最相似的查询，并参考其 SQL 结构生成新的查询语句。\n\n\
         工作原则：\n\
         1. 仔细分析用户问题的意图、时间范围、查询对象等信息\n\
         2. 从提供的示例中找到最相似的查询模式\n\
         3. 参考匹配示例的 SQL 结构，但要适应用户的具体需求\n\
         4. 如果没有完全匹配的示例，可以结合多个相似示例的模式"
            .to_string(),
    );

    parts.push("\n📝 【用户问题】".to_string());
    parts.push(question.to_string());

    parts.push("\n📚 【SQL 查询示例库】".to_string());
    parts.push("=".repeat(60));
    parts.push("请仔细分析以下所有示例，找到与用户问题最相似的查询模式：\n".to_string());

    for (index, shot) in shots.iter().enumerate() {
        parts.push(format!("\n🔸 示例 {}:", index + 1));
        parts.push(format!("问题: {}", shot.question));
        parts.push(format!("SQL:\n{}", shot.sql));
        if !shot.where_conditions.is_empty() {
            parts.push("WHERE 条件结构:".to_string());
            for condition in &shot.where_conditions {
                let value = match &condition.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parts.push(format!(
                    "  - {} {} '{}'  // {}",
                    condition.field, condition.operator, value, condition.description
                ));
            }
        }
        parts.push("-".repeat(40));
    }

    parts.push(
        "\n📤 【输出要求】\n\
         请分析用户问题与示例的相似性，然后按照以下格式返回：\n\n\
         【相似度】\n\
         95\n\n\
         【SQL】\n\
         SELECT COUNT(DISTINCT aircraft_icao), COUNT(1)\n\
         FROM dws_aircraft_flight_line_tmp\n\
         WHERE day_key = '2025-12-06' AND aircraft_model LIKE '%C-17%'\n\n\
         【匹配说明】\n\
         选择了示例2，相似度95%，因为都是关于特定飞机型号的统计分析。将示例中的日期和机型替换为用户问题中的具体参数。\n\n\
         注意：\n\
         1. 【相似度】必须是0-100之间的整数，表示用户问题与最相似示例的匹配程度\n\
         2. 【SQL】部分必须是完整的可执行查询语句\n\
         3. 【匹配说明】简要说明选择了哪个示例、相似度评分及修改原因\n\
         4. 相似度90分以上为高度匹配，70-89分为中等匹配，70分以下为低度匹配"
            .to_string(),
    );

    Some(parts.join("\n"))
}

/// Pulls the 0-100 similarity score out of a matcher reply: the 【相似度】
/// marker first, then a `相似度NN%` phrase, then any bare percentage. Total
/// failure scores 0.
pub fn extract_similarity(reply: &str) -> u8 {
    let marker = Regex::new(r"【相似度】\s*(\d+)").unwrap();
    if let Some(caps) = marker.captures(reply) {
        if let Ok(score) = caps[1].parse::<i64>() {
            return score.clamp(0, 100) as u8;
        }
    }

    let phrase = Regex::new(r"相似度(\d+)%").unwrap();
    if let Some(caps) = phrase.captures(reply) {
        if let Ok(score) = caps[1].parse::<i64>() {
            return score.clamp(0, 100) as u8;
        }
    }

    let percent = Regex::new(r"(\d{1,3})%").unwrap();
    if let Some(caps) = percent.captures(reply) {
        if let Ok(score) = caps[1].parse::<i64>() {
            if (0..=100).contains(&score) {
                return score as u8;
            }
        }
    }

    0
}

/// Pulls the adapted SQL out of a matcher reply: the 【SQL】 section first,
/// then a fenced code block, then the first SELECT/WITH line.
pub fn extract_sql_from_template(reply: &str) -> String {
    if let Some(section) = section_between(reply, "【SQL】", &["【"]) {
        if !section.is_empty() {
            return clean_sql(&section);
        }
    }

    if let Some(block) = extract_fenced_sql(reply) {
        return clean_sql(&block);
    }

    for line in reply.lines() {
        let line = line.trim();
        let upper = line.to_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") {
            return clean_sql(line);
        }
    }

    String::new()
}

/// Extracts WHERE-condition triples and the tables used from a confirmed
/// (question, SQL) pair, so the conversation can be stored as a reusable
/// few-shot example. Malformed entries are dropped.
pub async fn extract_where_and_tables(
    chat: &dyn ChatApi,
    options: ChatOptions,
    question: &str,
    sql: &str,
) -> Result<(Vec<WhereCondition>, Vec<String>)> {
    let system = "你是SQL条件提取专家。请完成两个任务：\
                  1. 从SQL中提取WHERE条件 \
                  2. 识别SQL中使用的所有表名（FROM、JOIN子句中的表）\
                  不要返回markdown，不要返回额外文本。\
                  输出必须是严格的JSON格式：\
                  {\"where_conditions\": [...], \"tables\": [\"表1\", \"表2\"]}\
                  where_conditions每个元素格式：\
                  {\"field\":\"\",\"operator\":\"eq|ne|gt|lt|gte|lte|like|in\",\"value\":任意类型,\"description\":\"\"}\
                  如果没有条件，where_conditions返回空数组[]。\
                  tables返回所有用到的表名，如果没有表返回空数组[]。";
    let user = format!("问题:\n{}\n\nSQL:\n{}\n\n请提取WHERE条件和表名，严格返回JSON对象。", question, sql);

    let reply = chat
        .chat(&[ChatMessage::system(system), ChatMessage::user(user)], options)
        .await?;

    let Some(parsed) = parse_json_flexible(&reply) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut conditions = Vec::new();
    if let Some(raw) = parsed.get("where_conditions").and_then(|v| v.as_array()) {
        for item in raw {
            let field = item.get("field").and_then(|v| v.as_str()).unwrap_or_default();
            let operator = item.get("operator").and_then(|v| v.as_str()).unwrap_or_default();
            if field.is_empty() || operator.is_empty() {
                continue;
            }
            conditions.push(WhereCondition {
                field: field.to_string(),
                operator: operator.to_string(),
                value: item.get("value").cloned().unwrap_or(serde_json::Value::Null),
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    let tables = parsed
        .get("tables")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok((conditions, tables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedChat;

    fn example(question: &str, sql: &str) -> QaExample {
        QaExample {
            id: 1,
            task_id: 1,
            question: question.to_string(),
            sql: sql.to_string(),
            where_conditions: Vec::new(),
            tables: Vec::new(),
            is_enabled: true,
        }
    }

    #[tokio::test]
    async fn empty_library_returns_zero_without_llm_call() {
        let chat = ScriptedChat::new(vec![]);
        let mut matcher = SimilarityMatcher::new(&chat, ChatOptions::new(0.1, Some(4000)));
        let outcome = matcher.match_sql("今天有多少订单？", &[]).await.unwrap();
        assert_eq!(outcome.sql, "");
        assert_eq!(outcome.similarity, 0);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn examples_missing_sql_are_unusable() {
        let chat = ScriptedChat::new(vec![]);
        let mut matcher = SimilarityMatcher::new(&chat, ChatOptions::new(0.1, Some(4000)));
        let outcome = matcher
            .match_sql("今天有多少订单？", &[example("只有问题", "")])
            .await
            .unwrap();
        assert_eq!(outcome.similarity, 0);
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn adapts_the_closest_example() {
        let reply = "【相似度】\n95\n\n【SQL】\nSELECT COUNT(*) FROM orders WHERE day = CURRENT_DATE - 1\n\n【匹配说明】\n选择了示例1，相似度95%。";
        let chat = ScriptedChat::new(vec![reply]);
        let mut matcher = SimilarityMatcher::new(&chat, ChatOptions::new(0.1, Some(4000)));
        let outcome = matcher
            .match_sql(
                "昨天有多少订单？",
                &[example("今天有多少订单？", "SELECT COUNT(*) FROM orders WHERE day = CURRENT_DATE")],
            )
            .await
            .unwrap();
        assert_eq!(outcome.similarity, 95);
        assert_eq!(outcome.sql, "SELECT COUNT(*) FROM orders WHERE day = CURRENT_DATE - 1");

        let prompt = chat.prompt(0);
        assert!(prompt.contains("【用户问题】"));
        assert!(prompt.contains("今天有多少订单？"));
    }

    #[test]
    fn where_conditions_are_rendered_into_the_prompt() {
        let mut shot = example("按状态统计", "SELECT status, COUNT(*) FROM orders GROUP BY status");
        shot.where_conditions.push(WhereCondition {
            field: "status".to_string(),
            operator: "eq".to_string(),
            value: serde_json::json!("paid"),
            description: "订单状态".to_string(),
        });
        let prompt = build_shot_prompt("统计已支付订单", &[shot]).unwrap();
        assert!(prompt.contains("WHERE 条件结构:"));
        assert!(prompt.contains("status eq 'paid'"));
    }

    #[test]
    fn similarity_falls_back_through_the_regex_chain() {
        assert_eq!(extract_similarity("【相似度】\n88"), 88);
        assert_eq!(extract_similarity("选择了示例2，相似度76%，因为……"), 76);
        assert_eq!(extract_similarity("匹配程度大约 60% 左右"), 60);
        assert_eq!(extract_similarity("完全无法判断"), 0);
        assert_eq!(extract_similarity("【相似度】\n150"), 100);
    }

    #[test]
    fn sql_extraction_falls_back_to_fenced_and_bare_lines() {
        let fenced = "这里是查询：\n```sql\nSELECT 1 FROM t\n```";
        assert_eq!(extract_sql_from_template(fenced), "SELECT 1 FROM t");

        let bare = "无法套用模板\nSELECT id FROM users\n以上";
        assert_eq!(extract_sql_from_template(bare), "SELECT id FROM users");

        assert_eq!(extract_sql_from_template("没有任何SQL"), "");
    }

    #[tokio::test]
    async fn harvesting_drops_malformed_conditions() {
        let reply = r#"{"where_conditions": [
            {"field": "day_key", "operator": "eq", "value": "2025-12-06", "description": "日期"},
            {"operator": "eq", "value": "missing field"}
        ], "tables": ["orders", ""]}"#;
        let chat = ScriptedChat::new(vec![reply]);
        let (conditions, tables) = extract_where_and_tables(
            &chat,
            ChatOptions::new(0.2, Some(2048)),
            "昨天有多少订单？",
            "SELECT COUNT(*) FROM orders WHERE day_key = '2025-12-06'",
        )
        .await
        .unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].field, "day_key");
        assert_eq!(tables, vec!["orders"]);
    }
}
