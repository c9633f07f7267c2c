//! Structured report formatting.
//!
//! Content payloads that parse as JSON and match a known report shape are
//! rendered through a shape-specific markdown template; everything else
//! degrades to the raw text or pretty-printed JSON. Formatting is total:
//! it never returns an error, and a partial shape renders the parts it has.

use serde_json::Value;

/// Render a free-form content payload for display.
#[must_use]
pub fn format_content(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => format_value(&value),
        Err(_) => text.to_string(),
    }
}

/// Render an already-parsed payload for display.
#[must_use]
pub fn format_value(value: &Value) -> String {
    let Some(object) = value.as_object() else {
        return fallback(value);
    };

    if object.contains_key("findings")
        || object.contains_key("key_figures")
        || object.contains_key("recommendations")
    {
        return format_specialist_report(value);
    }
    if object.contains_key("executive_summary")
        || object.contains_key("action_plan")
        || object.contains_key("actions")
    {
        return format_executive_summary(value);
    }
    if object.contains_key("perspective") || object.contains_key("critique") {
        return format_perspective(value);
    }
    if object.contains_key("summary") {
        return format_moderator_summary(value);
    }
    fallback(value)
}

/// Specialist report: key figures, findings with severity, prioritized
/// recommendations. Missing sections are simply omitted.
fn format_specialist_report(value: &Value) -> String {
    let mut out = String::new();

    if let Some(title) = string_field(value, "title") {
        push_heading(&mut out, &title);
    }
    if let Some(summary) = string_field(value, "summary") {
        push_paragraph(&mut out, &summary);
    }

    if let Some(figures) = value.get("key_figures") {
        push_section(&mut out, "Key figures");
        match figures {
            Value::Object(map) => {
                for (name, figure) in map {
                    push_bullet(&mut out, &format!("{name}: {}", scalar_text(figure)));
                }
            }
            Value::Array(items) => {
                for item in items {
                    let label = string_field(item, "label")
                        .or_else(|| string_field(item, "name"))
                        .unwrap_or_else(|| scalar_text(item));
                    match item.get("value") {
                        Some(figure) => {
                            push_bullet(&mut out, &format!("{label}: {}", scalar_text(figure)));
                        }
                        None => push_bullet(&mut out, &label),
                    }
                }
            }
            other => push_paragraph(&mut out, &scalar_text(other)),
        }
    }

    if let Some(findings) = value.get("findings").and_then(Value::as_array) {
        push_section(&mut out, "Findings");
        for finding in findings {
            let text = string_field(finding, "title")
                .or_else(|| string_field(finding, "finding"))
                .or_else(|| string_field(finding, "detail"))
                .unwrap_or_else(|| scalar_text(finding));
            match string_field(finding, "severity") {
                Some(severity) => {
                    push_bullet(&mut out, &format!("[{}] {text}", severity.to_uppercase()));
                }
                None => push_bullet(&mut out, &text),
            }
            if let Some(detail) = string_field(finding, "detail")
                && string_field(finding, "title").is_some()
            {
                push_indented(&mut out, &detail);
            }
        }
    }

    if let Some(recommendations) = value.get("recommendations").and_then(Value::as_array) {
        push_section(&mut out, "Recommendations");
        let mut ordered: Vec<&Value> = recommendations.iter().collect();
        ordered.sort_by_key(|item| priority_rank(item));
        for (position, item) in ordered.iter().enumerate() {
            let text = string_field(item, "text")
                .or_else(|| string_field(item, "recommendation"))
                .unwrap_or_else(|| scalar_text(item));
            out.push_str(&format!("{}. {text}\n", position + 1));
        }
    }

    finished(out, value)
}

fn format_moderator_summary(value: &Value) -> String {
    let mut out = String::new();
    push_heading(&mut out, "Discussion summary");
    if let Some(summary) = string_field(value, "summary") {
        push_paragraph(&mut out, &summary);
    }
    if let Some(themes) = value.get("themes").and_then(Value::as_array) {
        push_section(&mut out, "Themes");
        for theme in themes {
            push_bullet(&mut out, &scalar_text(theme));
        }
    }
    if let Some(consensus) = string_field(value, "consensus") {
        push_section(&mut out, "Consensus");
        push_paragraph(&mut out, &consensus);
    }
    finished(out, value)
}

fn format_perspective(value: &Value) -> String {
    let mut out = String::new();
    let speaker = string_field(value, "speaker").or_else(|| string_field(value, "specialist"));
    match &speaker {
        Some(speaker) => push_heading(&mut out, &format!("Perspective: {speaker}")),
        None => push_heading(&mut out, "Perspective"),
    }
    if let Some(perspective) = string_field(value, "perspective") {
        push_paragraph(&mut out, &perspective);
    }
    if let Some(critique) = string_field(value, "critique") {
        push_section(&mut out, "Critique");
        push_paragraph(&mut out, &critique);
    }
    finished(out, value)
}

fn format_executive_summary(value: &Value) -> String {
    let mut out = String::new();
    push_heading(&mut out, "Executive summary");
    if let Some(summary) = string_field(value, "executive_summary") {
        push_paragraph(&mut out, &summary);
    }
    let actions = value
        .get("action_plan")
        .or_else(|| value.get("actions"))
        .and_then(Value::as_array);
    if let Some(actions) = actions {
        push_section(&mut out, "Action plan");
        for (position, action) in actions.iter().enumerate() {
            let text = string_field(action, "text")
                .or_else(|| string_field(action, "action"))
                .unwrap_or_else(|| scalar_text(action));
            out.push_str(&format!("{}. {text}\n", position + 1));
        }
    }
    finished(out, value)
}

/// A template that produced nothing falls back rather than returning an
/// empty string.
fn finished(out: String, value: &Value) -> String {
    let trimmed = out.trim_end();
    if trimmed.is_empty() {
        fallback(value)
    } else {
        trimmed.to_string()
    }
}

fn fallback(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => {
            let pretty = serde_json::to_string_pretty(other)
                .unwrap_or_else(|_| other.to_string());
            format!("```json\n{pretty}\n```")
        }
    }
}

fn string_field(value: &Value, name: &str) -> Option<String> {
    let text = value.get(name)?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn priority_rank(item: &Value) -> i64 {
    if let Some(priority) = item.get("priority") {
        if let Some(number) = priority.as_i64() {
            return number;
        }
        if let Some(label) = priority.as_str() {
            return match label.to_ascii_lowercase().as_str() {
                "critical" | "p0" => 0,
                "high" | "p1" => 1,
                "medium" | "p2" => 2,
                "low" | "p3" => 3,
                _ => 4,
            };
        }
    }
    i64::MAX
}

fn push_heading(out: &mut String, text: &str) {
    out.push_str(&format!("## {text}\n\n"));
}

fn push_section(out: &mut String, text: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("### {text}\n"));
}

fn push_paragraph(out: &mut String, text: &str) {
    out.push_str(text);
    out.push('\n');
}

fn push_bullet(out: &mut String, text: &str) {
    out.push_str(&format!("- {text}\n"));
}

fn push_indented(out: &mut String, text: &str) {
    out.push_str(&format!("  {text}\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn specialist_report_renders_all_sections() {
        let report = json!({
            "title": "Liquidity review",
            "summary": "Cash position is tight but serviceable.",
            "key_figures": {"runway_months": 9, "burn": "1.2M"},
            "findings": [
                {"title": "Receivables aging", "severity": "high", "detail": "DSO up 12 days."},
                {"title": "Covenant headroom", "severity": "low"},
            ],
            "recommendations": [
                {"priority": "low", "text": "Revisit vendor terms."},
                {"priority": "critical", "text": "Accelerate collections."},
            ],
        });

        let rendered = format_value(&report);
        assert!(rendered.contains("## Liquidity review"));
        assert!(rendered.contains("### Key figures"));
        assert!(rendered.contains("- runway_months: 9"));
        assert!(rendered.contains("[HIGH] Receivables aging"));
        assert!(rendered.contains("  DSO up 12 days."));
        // Critical outranks low regardless of listing order.
        assert!(rendered.contains("1. Accelerate collections."));
        assert!(rendered.contains("2. Revisit vendor terms."));
    }

    #[test]
    fn moderator_summary_shape() {
        let rendered = format_value(&json!({
            "summary": "The panel leaned positive.",
            "themes": ["growth", "pricing"],
            "consensus": "Proceed with caution.",
        }));
        assert!(rendered.contains("## Discussion summary"));
        assert!(rendered.contains("- growth"));
        assert!(rendered.contains("### Consensus"));
    }

    #[test]
    fn perspective_and_critique_shape() {
        let rendered = format_value(&json!({
            "speaker": "Risk",
            "perspective": "Downside is underpriced.",
            "critique": "The draft ignores FX exposure.",
        }));
        assert!(rendered.contains("## Perspective: Risk"));
        assert!(rendered.contains("### Critique"));
    }

    #[test]
    fn executive_summary_shape() {
        let rendered = format_value(&json!({
            "executive_summary": "Ship it.",
            "action_plan": [{"action": "Close the gap."}, "Review in Q4."],
        }));
        assert!(rendered.contains("## Executive summary"));
        assert!(rendered.contains("1. Close the gap."));
        assert!(rendered.contains("2. Review in Q4."));
    }

    #[test]
    fn partial_shape_renders_what_it_has() {
        let rendered = format_value(&json!({"findings": []}));
        // Empty sections collapse to the JSON fallback rather than an
        // empty string.
        assert!(!rendered.is_empty());
    }

    #[test]
    fn unknown_json_pretty_prints_and_text_passes_through() {
        let rendered = format_value(&json!({"telemetry": {"cpu": 0.4}}));
        assert!(rendered.starts_with("```json"));

        assert_eq!(format_content("plain words"), "plain words");
        assert!(format_content("{\"summary\":\"hi\"}").contains("hi"));
    }

    #[test]
    fn formatting_never_panics_on_hostile_shapes() {
        for value in [
            json!(null),
            json!(42),
            json!([]),
            json!({"findings": "not an array"}),
            json!({"recommendations": [null, 7, {"priority": []}]}),
            json!({"key_figures": 3}),
        ] {
            let rendered = format_value(&value);
            assert!(!rendered.is_empty());
        }
    }
}
