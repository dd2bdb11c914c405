//! Secret placeholder rendering for SQL templates.
//!
//! Placeholders take the form `${{ secrets.NAME }}` where `NAME` is one or
//! more of `[A-Z0-9_]`. Names without a matching secret stay verbatim.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Templates larger than this are returned unrendered.
pub const MAX_RENDER_SIZE: usize = 1024 * 1024;

static SECRET_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*secrets\.(?P<name>[A-Z0-9_]+)\s*\}\}").expect("valid regex")
});

/// Render secret placeholders in `template` using `secrets`.
pub fn render_statement(template: &str, secrets: &HashMap<String, String>) -> String {
    if template.is_empty() || secrets.is_empty() || template.len() > MAX_RENDER_SIZE {
        return template.to_string();
    }

    SECRET_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match secrets.get(&caps["name"]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Shortest run of secret characters masked when only part of a value appears.
pub const MIN_REDACTED_FRAGMENT: usize = 4;

/// Replace secret values in `text` with their placeholders.
///
/// Drivers often echo a truncated piece of the statement, so any run of at
/// least [`MIN_REDACTED_FRAGMENT`] bytes shared with a secret value is masked,
/// not only whole values. Values shorter than that are masked when whole.
pub fn redact_secrets(text: &str, secrets: &HashMap<String, String>) -> String {
    let mut spans: Vec<(usize, usize, &str)> = Vec::new();
    for (name, value) in secrets.iter().filter(|(_, v)| !v.is_empty()) {
        let min_len = MIN_REDACTED_FRAGMENT.min(value.len());
        for (start, end) in shared_fragments(text, value.as_bytes(), min_len) {
            spans.push((start, end, name.as_str()));
        }
    }
    if spans.is_empty() {
        return text.to_string();
    }
    spans.sort_by_key(|&(start, end, _)| (start, std::cmp::Reverse(end)));

    let mut redacted = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, name) in spans {
        if start < cursor {
            // Overlaps the span already masked.
            cursor = cursor.max(end);
            continue;
        }
        redacted.push_str(&text[cursor..start]);
        redacted.push_str(&format!("${{{{ secrets.{name} }}}}"));
        cursor = end;
    }
    redacted.push_str(&text[cursor..]);
    redacted
}

/// Byte ranges of `text` that match a run of at least `min_len` bytes of
/// `value`, widened to character boundaries.
fn shared_fragments(text: &str, value: &[u8], min_len: usize) -> Vec<(usize, usize)> {
    let hay = text.as_bytes();
    // prev[j]: length of the common run ending at hay[i - 2] and value[j - 1].
    let mut prev = vec![0usize; value.len() + 1];
    let mut curr = vec![0usize; value.len() + 1];
    let mut spans = Vec::new();

    for i in 1..=hay.len() {
        let mut longest = 0;
        for j in 1..=value.len() {
            curr[j] = if hay[i - 1] == value[j - 1] { prev[j - 1] + 1 } else { 0 };
            longest = longest.max(curr[j]);
        }
        if longest >= min_len {
            let mut start = i - longest;
            let mut end = i;
            while !text.is_char_boundary(start) {
                start -= 1;
            }
            while !text.is_char_boundary(end) {
                end += 1;
            }
            spans.push((start, end));
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_single_secret() {
        let rendered = render_statement("${{ secrets.API_KEY }}", &secrets(&[("API_KEY", "xyz")]));
        assert_eq!(rendered, "xyz");
    }

    #[test]
    fn test_render_without_secrets_is_identity() {
        let template = "INSERT INTO t VALUES ('${{ secrets.PASSWORD }}');";
        assert_eq!(render_statement(template, &HashMap::new()), template);
        assert_eq!(render_statement("", &secrets(&[("A", "b")])), "");
    }

    #[test]
    fn test_render_multiple_and_repeated() {
        let template =
            "CREATE USER u IDENTIFIED BY '${{secrets.PW}}'; GRANT ${{ secrets.ROLE }} TO u; -- ${{ secrets.PW }}";
        let rendered = render_statement(template, &secrets(&[("PW", "hunter2"), ("ROLE", "reader")]));
        assert_eq!(
            rendered,
            "CREATE USER u IDENTIFIED BY 'hunter2'; GRANT reader TO u; -- hunter2"
        );
        assert!(!rendered.contains("${{"));
    }

    #[test]
    fn test_render_leaves_unknown_names() {
        let template = "SELECT '${{ secrets.KNOWN }}', '${{ secrets.UNKNOWN }}'";
        let rendered = render_statement(template, &secrets(&[("KNOWN", "1")]));
        assert_eq!(rendered, "SELECT '1', '${{ secrets.UNKNOWN }}'");
    }

    #[test]
    fn test_render_ignores_lowercase_names() {
        let template = "${{ secrets.lower }}";
        assert_eq!(render_statement(template, &secrets(&[("lower", "x")])), template);
    }

    #[test]
    fn test_render_size_guard() {
        let mut template = "${{ secrets.A }}".to_string();
        template.push_str(&" ".repeat(MAX_RENDER_SIZE));
        assert_eq!(render_statement(&template, &secrets(&[("A", "b")])), template);
    }

    #[test]
    fn test_redact_secrets() {
        let message = "error near 'hunter2' at line 1";
        assert_eq!(
            redact_secrets(message, &secrets(&[("PW", "hunter2")])),
            "error near '${{ secrets.PW }}' at line 1"
        );
        assert_eq!(redact_secrets(message, &HashMap::new()), message);
    }

    #[test]
    fn test_redact_truncated_echo() {
        let secrets = secrets(&[("TOKEN", "tok_live_ABCDEFGHIJKLMNOP")]);
        let rendered = render_statement("SET @t = '${{ secrets.TOKEN }}' garbage", &secrets);
        // Drivers cut the echoed statement at a fixed width.
        let message = format!("syntax error near '{}'", &rendered[..24]);

        let redacted = redact_secrets(&message, &secrets);
        assert_eq!(redacted, "syntax error near 'SET @t = '${{ secrets.TOKEN }}'");
        assert!(!redacted.contains("tok_live"));
    }

    #[test]
    fn test_redact_fragment_at_start_of_echo() {
        let secrets = secrets(&[("TOKEN", "tok_live_ABCDEFGHIJKLMNOP")]);
        let redacted = redact_secrets("error near 'KLMNOP' garbage'", &secrets);
        assert_eq!(redacted, "error near '${{ secrets.TOKEN }}' garbage'");
    }

    #[test]
    fn test_redact_short_value_only_whole() {
        let secrets = secrets(&[("PIN", "42")]);
        assert_eq!(redact_secrets("pin 42 rejected, 4 left", &secrets), "pin ${{ secrets.PIN }} rejected, 4 left");
    }

    #[test]
    fn test_redact_multiple_secrets() {
        let secrets = secrets(&[("USER", "svc_reporting"), ("PW", "hunter2hunter2")]);
        let redacted = redact_secrets("access denied for svc_reporting using 'hunter2hun", &secrets);
        assert_eq!(
            redacted,
            "access denied for ${{ secrets.USER }} using '${{ secrets.PW }}"
        );
    }
}
