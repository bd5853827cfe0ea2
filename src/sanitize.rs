//! Untrusted-input sanitization (spec.md §4.A).
//!
//! Pure functions, no state. Called at every trust boundary: stream
//! ingress, log emission, and before using a value as a map key.

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_STRING_LEN: usize = 1024;
const MAX_AGENT_ID_LEN: usize = 64;

fn strip_control_chars(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\r' | '\n' => ' ',
            '\t' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

fn collapse_traversal(input: &str) -> String {
    input.replace("..", "_")
}

fn strip_path_separators(input: &str) -> String {
    input.chars().map(|c| match c {
        '/' | '\\' => '_',
        '\0' => '_',
        c => c,
    }).collect()
}

fn truncate(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}

/// Normalize a free-text field for safe logging or display. Truncates to
/// 1024 chars, strips control characters, collapses `..`, and replaces
/// path separators and NUL.
pub fn sanitize_string(input: &str) -> String {
    let truncated = truncate(input, MAX_STRING_LEN);
    let no_control = strip_control_chars(&truncated);
    let no_traversal = collapse_traversal(&no_control);
    let result = strip_path_separators(&no_traversal);
    if result.is_empty() {
        "unknown".to_string()
    } else {
        result
    }
}

/// Normalize a hostname for use as a registry key and log field. Truncates
/// to 255 chars; if the result doesn't match
/// `[A-Za-z0-9]([A-Za-z0-9._-]{0,253}[A-Za-z0-9])?`, every disallowed byte
/// is replaced with `_`. Empty output becomes `"unknown"`.
pub fn sanitize_hostname(input: &str) -> String {
    let truncated = truncate(input, MAX_HOSTNAME_LEN);
    let no_control = strip_control_chars(&truncated);
    let no_traversal = collapse_traversal(&no_control);

    let chars: Vec<char> = no_traversal.chars().collect();
    if chars.is_empty() {
        return "unknown".to_string();
    }

    let is_valid_char = |c: char, is_edge: bool| {
        if is_edge {
            c.is_ascii_alphanumeric()
        } else {
            c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
        }
    };

    let last = chars.len() - 1;
    let sanitized: String = chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let is_edge = i == 0 || i == last;
            if is_valid_char(c, is_edge) {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Normalize a server-minted or agent-supplied agent id. Truncates to 64
/// chars and strips anything not URL-safe.
pub fn sanitize_agent_id(input: &str) -> String {
    let truncated = truncate(input, MAX_AGENT_ID_LEN);
    let sanitized: String = truncated
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}
