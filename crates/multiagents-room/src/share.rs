//! Pass detection, share extraction, and coordination pattern helpers.

use std::sync::LazyLock;

use regex::Regex;

/// Stored in history when a response carried no shareable content.
pub const PRIVATE_PLACEHOLDER: &str = "(private response withheld)";

static SHARE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<Share>(.*?)</Share>").unwrap());
static THINKING_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:thinking|antThinking)>[\s\S]*?</(?:thinking|antThinking)>").unwrap()
});

// Coordination pattern regexes — mirrored by the web frontend.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@(\w+)").unwrap());
static AGREEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\+1\s+(\w+)").unwrap());
static HANDOFF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[HANDOFF:(\w+)\]").unwrap());
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\[(?:(?:STATUS:\s*)?(EXPLORE|DECISION|BLOCKED|DONE|TODO|QUESTION))\]|\[STATUS:\s*([^\]\n]+)\]",
    )
    .unwrap()
});

/// True iff the trimmed text is exactly the pass marker.
pub fn detect_pass(text: &str) -> bool {
    text.trim() == "[PASS]"
}

/// Extract content from `<Share>` tags; placeholder when none are found.
///
/// Multiple `<Share>` blocks are concatenated with blank lines. Thinking
/// blocks are stripped first so a `<Share>` accidentally opened inside a
/// thinking block doesn't swallow the whole response.
pub fn extract_shareable(text: &str) -> String {
    if detect_pass(text) {
        return "[PASS]".to_string();
    }
    let cleaned = THINKING_BLOCK_RE.replace_all(text, "");
    let shareable = SHARE_TAG_RE
        .captures_iter(&cleaned)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if shareable.is_empty() {
        PRIVATE_PLACEHOLDER.to_string()
    } else {
        shareable
    }
}

/// Extract `@AgentName` mentions. Mentions following a `/` (paths) are
/// ignored.
pub fn extract_mentions(text: &str) -> Vec<String> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|c| {
            let m = c.get(0)?;
            if m.start() > 0 && text.as_bytes()[m.start() - 1] == b'/' {
                return None;
            }
            Some(c.get(1)?.as_str().to_string())
        })
        .collect()
}

/// Extract `+1 AgentName` agreements.
pub fn extract_agreements(text: &str) -> Vec<String> {
    AGREEMENT_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Extract `[HANDOFF:Agent]` patterns as `(agent, trailing context)` pairs.
///
/// Context is the first sentence following the tag, capped at 100 chars.
pub fn extract_handoffs(text: &str) -> Vec<(String, String)> {
    HANDOFF_RE
        .captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let agent = c.get(1)?.as_str().to_string();
            let after = text[whole.end()..].trim();
            let context = after
                .split('.')
                .next()
                .unwrap_or("")
                .chars()
                .take(100)
                .collect::<String>()
                .trim()
                .to_string();
            Some((agent, context))
        })
        .collect()
}

/// Extract `[STATUS]`-style indicators.
pub fn extract_statuses(text: &str) -> Vec<String> {
    STATUS_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .filter_map(|m| {
            let normalized = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            (!normalized.is_empty()).then_some(normalized)
        })
        .collect()
}

/// Lowercase and collapse whitespace runs, for relay dedup keys.
pub fn normalize_relay_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_detection_requires_exact_marker() {
        assert!(detect_pass("[PASS]"));
        assert!(detect_pass("  [PASS]\n"));
        assert!(!detect_pass("[PASS] and more"));
        assert!(!detect_pass("[pass]"));
    }

    #[test]
    fn share_extraction_concatenates_blocks() {
        let text = "noise <Share>first</Share> middle <share>second</share>";
        assert_eq!(extract_shareable(text), "first\n\nsecond");
    }

    #[test]
    fn share_inside_thinking_does_not_leak() {
        let text = "<thinking>hidden <Share>secret</Share></thinking> outside";
        assert_eq!(extract_shareable(text), PRIVATE_PLACEHOLDER);

        // A <Share> opened inside thinking must not swallow the real one.
        let text = "<thinking>plan <Share>draft</thinking> <Share>real</Share>";
        assert_eq!(extract_shareable(text), "real");
    }

    #[test]
    fn no_tags_returns_placeholder() {
        assert_eq!(extract_shareable("just private text"), PRIVATE_PLACEHOLDER);
        assert_eq!(extract_shareable("<Share>   </Share>"), PRIVATE_PLACEHOLDER);
    }

    #[test]
    fn extraction_is_idempotent_on_extracted_output() {
        assert_eq!(extract_shareable("[PASS]"), "[PASS]");
        assert_eq!(extract_shareable(&extract_shareable("[PASS]")), "[PASS]");

        let pure = "<Share>use a monorepo</Share>";
        let once = extract_shareable(pure);
        assert_eq!(once, "use a monorepo");
    }

    #[test]
    fn mentions_skip_path_segments() {
        let mentions = extract_mentions("ping @claude and see src/@generated please");
        assert_eq!(mentions, vec!["claude"]);
    }

    #[test]
    fn handoff_context_is_first_sentence() {
        let handoffs =
            extract_handoffs("[HANDOFF:codex] implement the parser. Then test it.");
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].0, "codex");
        assert_eq!(handoffs[0].1, "implement the parser");
    }

    #[test]
    fn statuses_cover_bare_and_freeform_forms() {
        let statuses = extract_statuses("[DONE] then [STATUS: waiting on review]");
        assert_eq!(statuses, vec!["DONE", "waiting on review"]);
    }

    #[test]
    fn relay_normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_relay_text("  Hello\n\tWORLD  again "),
            "hello world again"
        );
    }
}
