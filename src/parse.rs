//! Lenient parsers for free-text LLM output, shared by every agent.
//!
//! These degrade to empty/partial values instead of erroring: model output is
//! not guaranteed syntactically perfect, and a half-parsed result is more
//! useful to the pipeline than a failure.

use regex::Regex;
use serde_json::Value;

/// Strips a leading/trailing fenced code block (```json ... ``` or ``` ... ```)
/// if the whole payload is wrapped in one.
pub fn strip_code_fence(content: &str) -> String {
    let text = content.trim();
    if text.starts_with("```") {
        if let (Some(first_newline), Some(last_fence)) = (text.find('\n'), text.rfind("```")) {
            if last_fence > first_newline {
                return text[first_newline + 1..last_fence].trim().to_string();
            }
        }
    }
    text.to_string()
}

/// Best-effort JSON object extraction: fenced block stripped first, then a
/// retry on the substring between the outermost braces. Total failure yields
/// an empty object.
pub fn parse_json_object(content: &str) -> Value {
    let text = strip_code_fence(content);

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        if value.is_object() {
            return value;
        }
    }

    if let (Some(left), Some(right)) = (text.find('{'), text.rfind('}')) {
        if right > left {
            if let Ok(value) = serde_json::from_str::<Value>(&text[left..=right]) {
                if value.is_object() {
                    return value;
                }
            }
        }
    }

    Value::Object(serde_json::Map::new())
}

/// Like [`parse_json_object`] but also accepts top-level arrays, trying the
/// bracketed substring before the braced one. Returns `None` when nothing
/// parseable is found.
pub fn parse_json_flexible(content: &str) -> Option<Value> {
    let text = strip_code_fence(content);

    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return Some(value);
    }

    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(value);
            }
        }
    }

    None
}

/// Extracts the text between `start` and the earliest of `ends` (or the end of
/// input when none of them occurs after `start`).
pub fn section_between(content: &str, start: &str, ends: &[&str]) -> Option<String> {
    let from = content.find(start)? + start.len();
    let rest = &content[from..];
    let until = ends.iter().filter_map(|end| rest.find(end)).min().unwrap_or(rest.len());
    Some(rest[..until].trim().to_string())
}

/// Extracts SQL from a fenced code block: ```sql blocks first, then any fence
/// whose content looks like a query.
pub fn extract_fenced_sql(content: &str) -> Option<String> {
    let sql_block = Regex::new(r"(?is)```sql\s*(.*?)\s*```").unwrap();
    if let Some(caps) = sql_block.captures(content) {
        return Some(caps[1].trim().to_string());
    }

    let any_block = Regex::new(r"(?s)```\s*(.*?)\s*```").unwrap();
    if let Some(caps) = any_block.captures(content) {
        let inner = caps[1].trim();
        let upper = inner.to_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") || upper.contains("FROM") {
            return Some(inner.to_string());
        }
    }

    None
}

/// Strips fence tokens and blank lines. Short statements (≤3 content lines)
/// are collapsed to one line; longer ones keep their line structure.
pub fn clean_sql(sql: &str) -> String {
    if sql.is_empty() {
        return String::new();
    }
    let fence = Regex::new(r"(?i)```sql|```").unwrap();
    let stripped = fence.replace_all(sql, "");
    let lines: Vec<&str> = stripped
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() > 3 {
        lines.join("\n")
    } else {
        lines.join(" ")
    }
}

/// Prepares an LLM-produced SQL string for execution: fences and blank lines
/// removed, any leading `sql:` label dropped, trailing semicolons stripped.
/// Idempotent under repeated application.
pub fn sanitize_sql(sql: &str) -> String {
    let cleaned = clean_sql(sql);
    let prefix = Regex::new(r"(?i)^\s*sql\s*[:：]\s*").unwrap();
    let mut text = prefix.replace(&cleaned, "").trim().to_string();
    while text.ends_with(';') {
        text.pop();
        text = text.trim_end().to_string();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json_block() {
        let content = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_json_object(content)["a"], 1);
    }

    #[test]
    fn recovers_object_from_surrounding_prose() {
        let content = "Here is the result:\n{\"selected_tables\": [\"orders\"]}\nDone.";
        let value = parse_json_object(content);
        assert_eq!(value["selected_tables"][0], "orders");
    }

    #[test]
    fn unparseable_content_yields_empty_object() {
        assert_eq!(parse_json_object("not json at all"), serde_json::json!({}));
    }

    #[test]
    fn flexible_parse_prefers_arrays() {
        let content = "relations below\n[{\"source_field\": \"id\"}]\n";
        let value = parse_json_flexible(content).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn section_between_stops_at_earliest_end() {
        let text = "【SQL】\nSELECT 1\n【匹配说明】\nbecause";
        let sql = section_between(text, "【SQL】", &["【匹配说明】", "【理由】"]).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn section_between_runs_to_end_without_marker() {
        let text = "【SQL】\nSELECT 2";
        assert_eq!(section_between(text, "【SQL】", &["【匹配说明】"]).unwrap(), "SELECT 2");
    }

    #[test]
    fn short_sql_collapses_to_one_line() {
        let sql = "SELECT *\nFROM orders\n";
        assert_eq!(clean_sql(sql), "SELECT * FROM orders");
    }

    #[test]
    fn long_sql_keeps_line_structure() {
        let sql = "SELECT a\nFROM t\nWHERE x = 1\nGROUP BY a";
        assert_eq!(clean_sql(sql), "SELECT a\nFROM t\nWHERE x = 1\nGROUP BY a");
    }

    #[test]
    fn sanitize_strips_label_and_semicolons() {
        assert_eq!(sanitize_sql("sql: SELECT 1;;"), "SELECT 1");
        assert_eq!(sanitize_sql("```sql\nSELECT 1;\n```"), "SELECT 1");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_sql("SQL：SELECT name FROM users;");
        let twice = sanitize_sql(&once);
        assert_eq!(once, "SELECT name FROM users");
        assert_eq!(once, twice);
    }

    #[test]
    fn fenced_sql_requires_query_shape_for_anonymous_blocks() {
        assert_eq!(
            extract_fenced_sql("```\nSELECT 1 FROM t\n```").as_deref(),
            Some("SELECT 1 FROM t")
        );
        assert_eq!(extract_fenced_sql("```\nhello world\n```"), None);
    }
}
