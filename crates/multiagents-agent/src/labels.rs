use serde_json::Value;

/// Map a CLI tool name to the display label the frontend renders as a badge.
///
/// Unknown names pass through unchanged.
pub fn display_label(tool_name: &str) -> &str {
    match tool_name {
        "Read" | "ReadFile" | "read_file" => "Read",
        "Edit" | "EditFile" | "edit_file" | "StrReplaceFile" => "Update",
        "Write" | "WriteFile" | "write_file" | "CreateFile" => "Write",
        "Bash" | "Shell" => "Run",
        "Glob" | "Grep" | "ListDir" | "SearchFiles" => "Search",
        "WebFetch" => "Fetch",
        "SetTodoList" => "Plan",
        other => other,
    }
}

/// Shorten an absolute file path or command for display.
pub fn short_path(p: &str) -> String {
    if p.is_empty() {
        return String::new();
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            if let Some(rest) = p.strip_prefix(&home) {
                return format!("~{rest}");
            }
        }
    }
    p.to_string()
}

/// Extract and shorten the most relevant detail from tool parameters.
pub fn extract_tool_detail(params: &Value) -> String {
    let raw = params
        .get("path")
        .or_else(|| params.get("file_path"))
        .or_else(|| params.get("command"))
        .and_then(Value::as_str)
        .unwrap_or("");
    short_path(raw)
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_tools_map_to_friendly_labels() {
        assert_eq!(display_label("Bash"), "Run");
        assert_eq!(display_label("StrReplaceFile"), "Update");
        assert_eq!(display_label("SetTodoList"), "Plan");
        assert_eq!(display_label("SomethingNew"), "SomethingNew");
    }

    #[test]
    fn tool_detail_prefers_path_over_command() {
        let detail = extract_tool_detail(&json!({"path": "/etc/hosts", "command": "cat"}));
        assert_eq!(detail, "/etc/hosts");
        let detail = extract_tool_detail(&json!({"command": "ls -la"}));
        assert_eq!(detail, "ls -la");
        assert_eq!(extract_tool_detail(&json!({})), "");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
