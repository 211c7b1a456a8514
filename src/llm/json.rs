//! Extraction of a JSON object from free-form LLM output.

/// Pull the first JSON object out of raw model output, tolerating fenced
/// code blocks and surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return balanced_object(trimmed);
    }

    let fence = "```";
    if let Some(start) = trimmed.find(fence) {
        let after_fence = &trimmed[start + fence.len()..];
        let after_lang = after_fence.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
        if let Some(end) = after_lang.find(fence) {
            let block = after_lang[..end].trim();
            if block.starts_with('{') {
                return balanced_object(block);
            }
        }
    }

    trimmed
        .find('{')
        .and_then(|start| balanced_object(&trimmed[start..]))
}

/// Return the shortest balanced `{...}` prefix of `text`.
fn balanced_object(text: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[..=idx].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
