use super::client::truncate_str;
use serde::Deserialize;

/// A single search/replace edit operation
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EditOp {
    /// Exact text to find; must match exactly once at application time
    pub(crate) old_string: String,
    pub(crate) new_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FixResponse {
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) edits: Vec<EditOp>,
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start <= end).then(|| &text[start..=end])
}

/// Model output to a fix response. Tolerates fences and chatter around the object.
pub(crate) fn parse_fix_response(response: &str) -> Result<FixResponse, String> {
    let clean = strip_markdown_fences(response);
    if clean.is_empty() {
        return Err("empty response".to_string());
    }
    let json = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
    serde_json::from_str(json).map_err(|e| {
        format!(
            "response is not a fix object ({}): {}",
            e,
            truncate_str(json, 200)
        )
    })
}

/// Truncate a string for error messages (UTF-8 safe)
fn truncate_for_error(s: &str) -> String {
    const MAX_CHARS: usize = 100;
    if s.chars().count() <= MAX_CHARS {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(MAX_CHARS).collect::<String>())
    }
}

/// Applies edits in order; each `old_string` must match exactly once.
pub(crate) fn apply_edits(content: &str, edits: &[EditOp]) -> Result<String, String> {
    let mut new_content = content.to_string();
    for (i, edit) in edits.iter().enumerate() {
        if edit.old_string.is_empty() {
            if new_content.is_empty() {
                new_content = edit.new_string.clone();
                continue;
            }
            return Err(format!(
                "edit {}: old_string is empty for a non-empty file",
                i + 1
            ));
        }

        match new_content.matches(edit.old_string.as_str()).count() {
            0 => {
                return Err(format!(
                    "edit {}: old_string not found; searched for {:?}",
                    i + 1,
                    truncate_for_error(&edit.old_string)
                ))
            }
            1 => {}
            n => {
                return Err(format!(
                    "edit {}: old_string matches {} times (must be unique); searched for {:?}",
                    i + 1,
                    n,
                    truncate_for_error(&edit.old_string)
                ))
            }
        }

        new_content = new_content.replacen(&edit.old_string, &edit.new_string, 1);
    }
    Ok(new_content)
}

/// Matches the trailing newline of `original`, keeping CRLF files CRLF.
pub(crate) fn normalize_trailing_newline(original: &str, content: String) -> String {
    let mut normalized = content;
    if original.ends_with('\n') {
        if !normalized.ends_with('\n') {
            if original.ends_with("\r\n") {
                normalized.push_str("\r\n");
            } else {
                normalized.push('\n');
            }
        }
    } else if !original.is_empty() {
        while normalized.ends_with('\n') {
            normalized.pop();
            if normalized.ends_with('\r') {
                normalized.pop();
            }
        }
    }
    normalized
}
