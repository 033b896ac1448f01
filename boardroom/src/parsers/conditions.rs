//! Free-text condition-list parsing.

/// Minimum useful condition length after bullet stripping.
const MIN_CONDITION_LEN: usize = 6;

/// Parse a multi-line blob of conditions into a cleaned, ordered list.
///
/// Drops empty lines, markup lines, and anything 5 characters or shorter
/// once leading bullet/numbering characters are stripped. Never fails;
/// empty input yields an empty list. Idempotent: re-parsing the joined
/// output returns the same list.
pub fn parse_conditions(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(clean_condition_line)
        .collect()
}

fn clean_condition_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('<') {
        return None;
    }
    let cleaned = trimmed
        .trim_start_matches(|c: char| {
            c.is_ascii_digit() || c.is_whitespace() || matches!(c, '-' | '•' | '*' | '.' | ')')
        })
        .trim();
    if cleaned.len() < MIN_CONDITION_LEN {
        return None;
    }
    Some(cleaned.to_string())
}
