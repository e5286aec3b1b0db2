//! Per-toolchain location extraction.
//!
//! Each extractor turns raw checker output into entries carrying an optional
//! file, a line (0 when unknown), the text used for categorization and a
//! short description.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Longest description kept on a failure.
pub const MAX_DESCRIPTION_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub file: Option<String>,
    pub line: u32,
    pub text: String,
    pub description: String,
}

impl Entry {
    fn new(file: Option<String>, line: u32, text: String, description: &str) -> Self {
        Self {
            file,
            line,
            text,
            description: truncate(description.trim(), MAX_DESCRIPTION_CHARS),
        }
    }

    /// Entry for output that failed without any recognizable location.
    pub fn fallback(text: &str) -> Self {
        let description = first_meaningful_line(text).unwrap_or("check failed");
        Self::new(None, 0, text.to_string(), description)
    }
}

// =============================================================================
// Pytest
// =============================================================================

static PYTEST_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_{3,} (.+?) _{3,}$").unwrap());
static PYTEST_BANNER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^={3,}.*={3,}$").unwrap());
static PYTEST_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+\.py):(\d+):").unwrap());
static PY_FILE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());
static PYTEST_COLLECTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ERROR collecting (\S+)").unwrap());
static PYTEST_ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^E\s+(.*)$").unwrap());
static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:FAILED|ERROR) ([^\s:]+)(?:::\S+)?(?: - (.*))?$").unwrap()
});
static PYTEST_VERBOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s:]+)::(\S+) (?:FAILED|ERROR)").unwrap());
static ERROR_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+(Error|Exception)\b|^assert\b").unwrap());

/// Pytest `--tb=short` output: one entry per FAILURES/ERRORS section, or one
/// per summary line when no sections were printed.
pub fn pytest(text: &str) -> Vec<Entry> {
    let mut sections: Vec<(&str, Vec<&str>)> = Vec::new();
    let mut current: Option<(&str, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some(caps) = PYTEST_SECTION.captures(line) {
            sections.extend(current.take());
            let header = caps.get(1).map_or("", |m| m.as_str());
            current = Some((header, Vec::new()));
        } else if PYTEST_BANNER.is_match(line) {
            sections.extend(current.take());
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    sections.extend(current);

    if !sections.is_empty() {
        return sections
            .into_iter()
            .map(|(header, body)| pytest_section(header, &body))
            .collect();
    }

    text.lines()
        .filter_map(|line| {
            if let Some(caps) = PYTEST_SUMMARY.captures(line) {
                let file = caps[1].to_string();
                let message = caps.get(2).map_or(line, |m| m.as_str());
                return Some(Entry::new(Some(file), 0, line.to_string(), message));
            }
            PYTEST_VERBOSE.captures(line).map(|caps| {
                Entry::new(Some(caps[1].to_string()), 0, line.to_string(), &caps[2])
            })
        })
        .collect()
}

fn pytest_section(header: &str, body: &[&str]) -> Entry {
    let error_lines: Vec<&str> = body
        .iter()
        .filter_map(|l| PYTEST_ERROR_LINE.captures(l))
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .collect();
    let joined = body.join("\n");

    let (file, line) = if let Some(caps) = PY_FILE_LINE.captures(&joined) {
        (Some(caps[1].to_string()), parse_line(&caps[2]))
    } else if let Some((path, line)) = body
        .iter()
        .filter_map(|l| PYTEST_LOCATION.captures(l))
        .map(|c| (c[1].to_string(), parse_line(&c[2])))
        .filter(|(path, _)| !path.contains("site-packages"))
        .last()
    {
        (Some(path), line)
    } else if let Some(caps) = PYTEST_COLLECTING.captures(header) {
        (Some(caps[1].to_string()), 0)
    } else {
        (None, 0)
    };

    let description = error_lines
        .iter()
        .find(|l| ERROR_MESSAGE.is_match(l))
        .or_else(|| error_lines.first())
        .copied()
        .unwrap_or(header);

    let text = if error_lines.is_empty() {
        format!("{header}\n{joined}")
    } else {
        error_lines.join("\n")
    };
    Entry::new(file, line, text, description)
}

// =============================================================================
// Jest
// =============================================================================

static JS_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[jt]sx?:(\d+):\d+").unwrap());
static JEST_TEST_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./-]+\.(?:test|spec)\.[jt]sx?)").unwrap());
/// Lines of context kept after a `●` marker in text output.
const JEST_CONTEXT_LINES: usize = 15;

/// Jest `--json` output, falling back to the human-readable `●` blocks.
pub fn jest(text: &str) -> Vec<Entry> {
    match find_json(text, '{', |v| v.get("testResults").is_some()) {
        Some(report) => jest_report(&report),
        None => jest_text(text),
    }
}

fn jest_report(report: &Value) -> Vec<Entry> {
    let mut entries = Vec::new();
    let suites = report["testResults"].as_array().map_or(&[][..], Vec::as_slice);

    for suite in suites {
        let file = suite["name"].as_str().map(str::to_string);
        let mut suite_entries = 0;

        for assertion in suite["assertionResults"].as_array().into_iter().flatten() {
            if assertion["status"].as_str() != Some("failed") {
                continue;
            }
            let message = assertion["failureMessages"]
                .as_array()
                .map(|msgs| {
                    msgs.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let line = assertion["location"]["line"]
                .as_u64()
                .map(|l| l as u32)
                .or_else(|| first_js_line(&message))
                .unwrap_or(0);
            let title = assertion["fullName"].as_str().unwrap_or("test failed");
            let description = first_meaningful_line(&message).unwrap_or(title);
            entries.push(Entry::new(file.clone(), line, message.clone(), description));
            suite_entries += 1;
        }

        // Suites that fail to load report no assertions, only a message.
        if suite_entries == 0 && suite["status"].as_str() == Some("failed") {
            let message = suite["message"].as_str().unwrap_or_default();
            if !message.trim().is_empty() {
                let line = first_js_line(message).unwrap_or(0);
                let description = first_meaningful_line(message).unwrap_or("test suite failed");
                entries.push(Entry::new(file.clone(), line, message.to_string(), description));
            }
        }
    }
    entries
}

fn jest_text(text: &str) -> Vec<Entry> {
    let lines: Vec<&str> = text.lines().collect();
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains('●') && !line.contains("FAIL"))
        .map(|(i, line)| {
            let end = (i + 1 + JEST_CONTEXT_LINES).min(lines.len());
            let context = lines[i..end].join("\n");
            let file = JEST_TEST_FILE
                .captures(&context)
                .map(|c| c[1].to_string());
            let line_no = first_js_line(&context).unwrap_or(0);
            let title = line.trim().trim_start_matches('●').trim();
            Entry::new(file, line_no, context, title)
        })
        .collect()
}

fn first_js_line(text: &str) -> Option<u32> {
    JS_LOCATION.captures(text).map(|c| parse_line(&c[1]))
}

// =============================================================================
// Flake8 / ESLint / generic
// =============================================================================

static FLAKE8_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):(\d+):\d+: ([A-Z]+\d+) (.+)$").unwrap());
static GENERIC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([^\s:]+\.[A-Za-z]{1,5}):(\d+)(?::\d+)?:?\s*(.*)$").unwrap()
});

/// Flake8 output in `path:row:col: CODE text` format.
pub fn flake8(text: &str) -> Vec<Entry> {
    text.lines()
        .filter_map(|line| FLAKE8_LINE.captures(line.trim()))
        .map(|caps| {
            let message = format!("{} {}", &caps[3], &caps[4]);
            Entry::new(
                Some(caps[1].to_string()),
                parse_line(&caps[2]),
                message.clone(),
                &message,
            )
        })
        .collect()
}

/// ESLint `--format=json` output.
pub fn eslint(text: &str) -> Vec<Entry> {
    let Some(report) = find_json(text, '[', Value::is_array) else {
        return generic(text);
    };
    let mut entries = Vec::new();
    for file in report.as_array().into_iter().flatten() {
        let path = file["filePath"].as_str().map(str::to_string);
        for message in file["messages"].as_array().into_iter().flatten() {
            let line = message["line"].as_u64().map_or(0, |l| l as u32);
            let body = message["message"].as_str().unwrap_or_default();
            let text = match message["ruleId"].as_str() {
                Some(rule) => format!("{rule}: {body}"),
                None => body.to_string(),
            };
            entries.push(Entry::new(path.clone(), line, text.clone(), &text));
        }
    }
    entries
}

/// Any output with `path:line:` prefixes.
pub fn generic(text: &str) -> Vec<Entry> {
    text.lines()
        .filter_map(|line| GENERIC_LINE.captures(line))
        .map(|caps| {
            let message = caps.get(3).map_or("", |m| m.as_str());
            let description = if message.is_empty() { &caps[0] } else { message };
            Entry::new(
                Some(caps[1].to_string()),
                parse_line(&caps[2]),
                caps[0].trim().to_string(),
                description,
            )
        })
        .collect()
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a JSON document in mixed output: the whole text, else the first line
/// opening with `open` that parses and satisfies `accept`.
fn find_json(text: &str, open: char, accept: impl Fn(&Value) -> bool) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with(open) {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if accept(&value) {
                return Some(value);
            }
        }
    }
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with(open))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|value| accept(value))
}

fn parse_line(digits: &str) -> u32 {
    digits.parse().unwrap_or(0)
}

fn first_meaningful_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.chars().all(|c| c == '_' || c == '=' || c == '-'))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
