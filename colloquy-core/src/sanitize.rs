//! Output sanitization and log hygiene.

/// Sanitize provider output before it is stored: drop HTML-like
/// constructs, strip control characters, and collapse whitespace runs.
/// Returns an empty string when nothing printable survives; the caller
/// decides what an empty result means.
pub fn sanitize_content(raw: &str) -> String {
    let stripped = strip_markup(raw);
    collapse_whitespace(&stripped)
}

/// Remove `<script>…</script>` blocks wholesale and any other tag-shaped
/// `<…>` span, plus `javascript:` scheme prefixes.
fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(rest) = tag_span(&input[i..]) {
                i += rest;
                continue;
            }
        }
        if has_prefix_ignore_case(&input[i..], "javascript:") {
            i += "javascript:".len();
            continue;
        }
        let ch = input[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Length of the tag-shaped span starting at a `<`, or `None` when the
/// text is not tag-shaped (a bare less-than stays).
fn tag_span(input: &str) -> Option<usize> {
    let mut chars = input.char_indices().skip(1);
    let (_, first) = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '/' || first == '!') {
        return None;
    }

    // A script open tag swallows everything through its close tag.
    if has_prefix_ignore_case(&input[1..], "script") {
        if let Some(close) = find_ignore_case(input, "</script>") {
            return Some(close + "</script>".len());
        }
    }

    for (idx, ch) in chars {
        if ch == '>' {
            return Some(idx + 1);
        }
    }
    // Unclosed tag: drop the rest of the text.
    Some(input.len())
}

fn has_prefix_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len()
        && haystack
            .chars()
            .zip(prefix.chars())
            .take(prefix.len())
            .all(|(a, b)| a.eq_ignore_ascii_case(&b))
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .filter(|i| haystack.is_char_boundary(*i))
        .find(|&i| has_prefix_ignore_case(&haystack[i..], needle))
}

/// Replace control characters with spaces (newlines survive), collapse
/// horizontal whitespace runs, and trim each line and the whole text.
fn collapse_whitespace(input: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for raw_line in input.split('\n') {
        let mut line = String::with_capacity(raw_line.len());
        let mut pending_space = false;
        for ch in raw_line.chars() {
            if ch.is_control() || ch.is_whitespace() {
                pending_space = !line.is_empty();
            } else {
                if pending_space {
                    line.push(' ');
                    pending_space = false;
                }
                line.push(ch);
            }
        }
        lines.push(line);
    }

    // Drop leading/trailing blank lines and squeeze interior runs of them.
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = 0usize;
    for line in &lines {
        if line.is_empty() {
            blank_run += 1;
            if !out.is_empty() && blank_run == 1 {
                out.push("");
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }
    while out.last() == Some(&"") {
        out.pop();
    }
    out.join("\n")
}

/// Stable 64-bit FNV-1a content hash, rendered as 16 hex digits. Used as
/// the per-message fingerprint.
pub fn fingerprint(content: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in content.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

/// Mask API-key-shaped tokens in a log line.
pub fn mask_credentials(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut token = String::new();

    let flush = |token: &mut String, out: &mut String| {
        if token.is_empty() {
            return;
        }
        out.push_str(mask_token(token));
        token.clear();
    };

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            token.push(ch);
        } else {
            flush(&mut token, &mut out);
            out.push(ch);
        }
    }
    flush(&mut token, &mut out);
    out
}

fn mask_token(token: &str) -> &str {
    if token.starts_with("sk-ant-") && token.len() >= 27 {
        "[ANTHROPIC_KEY]"
    } else if token.starts_with("sk-") && token.len() >= 23 {
        "[OPENAI_KEY]"
    } else if token.starts_with("pplx-") && token.len() >= 25 {
        "[PERPLEXITY_KEY]"
    } else if token.len() >= 30 && token.chars().all(|c| c.is_ascii_alphanumeric()) {
        "[API_KEY]"
    } else {
        // Short or punctuated tokens pass through untouched.
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_blocks_entirely() {
        let raw = "hello <script>alert('x')</script>world";
        assert_eq!(sanitize_content(raw), "hello world");
    }

    #[test]
    fn strips_tags_but_keeps_bare_less_than() {
        assert_eq!(sanitize_content("a <b>bold</b> claim"), "a bold claim");
        assert_eq!(sanitize_content("1 < 2 and 3 > 2"), "1 < 2 and 3 > 2");
    }

    #[test]
    fn drops_javascript_scheme() {
        assert_eq!(sanitize_content("click javascript:alert(1) here"), "click alert(1) here");
    }

    #[test]
    fn collapses_control_characters_and_runs() {
        assert_eq!(sanitize_content("a\u{0}\u{7}b   c\t\td"), "a b c d");
        assert_eq!(sanitize_content("  spaced\n\n\n\nout  "), "spaced\n\nout");
    }

    #[test]
    fn empty_after_sanitization() {
        assert_eq!(sanitize_content("<div></div>\u{1}\u{2}"), "");
    }

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let a = fingerprint("the same text");
        let b = fingerprint("the same text");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, fingerprint("different text"));
    }

    #[test]
    fn masks_key_shaped_tokens() {
        let line = "auth with sk-ant-REDACTED failed";
        assert_eq!(mask_credentials(line), "auth with [ANTHROPIC_KEY] failed");

        let line = "key=sk-abcdefghijklmnopqrst12 rest";
        assert_eq!(mask_credentials(line), "key=[OPENAI_KEY] rest");

        assert_eq!(mask_credentials("short sk-123 ok"), "short sk-123 ok");
    }
}
