use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

/// Cap on the stored message; classification and hashing see the full text.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Strips run-specific noise from failure text so that equivalent failures
/// produce the same string.
pub struct Normalizer {
    steps: Vec<(Regex, &'static str)>,
    unix_path: Regex,
    relative_path: Regex,
    line_suffix: Regex,
    line_word: Regex,
    whitespace: Regex,
    error_type: Regex,
}

impl Normalizer {
    pub fn new() -> Result<Self, regex::Error> {
        // Full timestamps before bare times.
        let steps = vec![
            (
                Regex::new(
                    r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
                )?,
                "<ts>",
            ),
            (Regex::new(r"\b\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\b")?, "<ts>"),
            (
                Regex::new(
                    r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
                )?,
                "<uuid>",
            ),
            (Regex::new(r"\b0[xX][0-9a-fA-F]+\b")?, "<addr>"),
            (Regex::new(r#"\b[A-Za-z]:\\[^\s:"',)]+"#)?, "<path>"),
        ];
        Ok(Self {
            steps,
            unix_path: Regex::new(r#"(^|[\s"'(=\[])(?:~|\.{1,2})?/[^\s:"',)\]]+"#)?,
            relative_path: Regex::new(r"\b[\w.-]+(?:/[\w.-]+)+\.[A-Za-z]\w*\b")?,
            line_suffix: Regex::new(r"<path>:\d+(?::\d+)?\b")?,
            line_word: Regex::new(r"(?i)\b(line) \d+\b")?,
            whitespace: Regex::new(r"\s+")?,
            error_type: Regex::new(
                r"\b((?:[A-Za-z_]\w*\.)*[A-Z]\w*(?:Error|Exception|Failure|Interrupt|Exit))\b",
            )?,
        })
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut text = raw.to_string();
        for (re, replacement) in &self.steps {
            text = re.replace_all(&text, *replacement).into_owned();
        }
        // Absolute paths first so the relative pattern never sees their tails.
        text = self
            .unix_path
            .replace_all(&text, |caps: &Captures| format!("{}<path>", &caps[1]))
            .into_owned();
        text = self.relative_path.replace_all(&text, "<path>").into_owned();
        text = self.line_suffix.replace_all(&text, "<path>").into_owned();
        text = self.line_word.replace_all(&text, "${1} <n>").into_owned();
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }

    /// Leading exception name, without module prefix ("selenium...TimeoutException" -> "TimeoutException").
    pub fn error_type(&self, text: &str) -> Option<String> {
        let caps = self.error_type.captures(text)?;
        let full = caps.get(1)?.as_str();
        Some(full.rsplit('.').next().unwrap_or(full).to_string())
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Cache key: depends on the normalized text only.
pub fn lookup_key(normalized: &str) -> String {
    sha256_hex(normalized.as_bytes())
}

/// Signature identity: deterministic in (category, normalized text).
pub fn signature_hash(category: &str, normalized: &str) -> String {
    sha256_hex(format!("{}\n{}", category, normalized).as_bytes())
}
