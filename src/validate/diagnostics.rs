//! Built-in structural checks and lint output classification.

use crate::core::files::{Diagnostic, Severity};
use crate::util::find_secret;

const SOURCE_STRUCTURE: &str = "structure";
const SOURCE_SECRETS: &str = "secrets";

fn diagnostic(severity: Severity, line: Option<usize>, message: impl Into<String>, source: &str) -> Diagnostic {
    Diagnostic {
        severity,
        line,
        message: message.into(),
        source: source.to_string(),
    }
}

/// Checks that need no external tooling.
pub fn structural(language: &str, content: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    if content.trim().is_empty() {
        out.push(diagnostic(Severity::Error, None, "file is empty", SOURCE_STRUCTURE));
        return out;
    }

    for (i, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<< ") || line == "=======" || line.starts_with(">>>>>>> ") {
            out.push(diagnostic(
                Severity::Error,
                Some(i + 1),
                "merge conflict marker",
                SOURCE_STRUCTURE,
            ));
        }
        if let Some(kind) = find_secret(line) {
            out.push(diagnostic(
                Severity::Warning,
                Some(i + 1),
                format!("possible hardcoded secret ({})", kind),
                SOURCE_SECRETS,
            ));
        }
    }

    if let Some(syntax) = Syntax::for_language(language) {
        if let Err((line, message)) = check_delimiters(content, syntax) {
            out.push(diagnostic(Severity::Error, Some(line), message, SOURCE_STRUCTURE));
        }
    }
    out
}

/// Comment and string conventions relevant to delimiter matching.
#[derive(Debug, Clone, Copy)]
struct Syntax {
    line_comment: Option<&'static str>,
    block_comment: bool,
    backtick_strings: bool,
    single_quote_strings: bool,
    triple_quote_strings: bool,
}

impl Syntax {
    fn for_language(language: &str) -> Option<Self> {
        let c_like = Syntax {
            line_comment: Some("//"),
            block_comment: true,
            backtick_strings: false,
            single_quote_strings: true,
            triple_quote_strings: false,
        };
        match language {
            "typescript" | "javascript" => Some(Syntax {
                backtick_strings: true,
                ..c_like
            }),
            "java" | "go" => Some(c_like),
            // Lifetimes make a lone `'` common in Rust.
            "rust" => Some(Syntax {
                single_quote_strings: false,
                ..c_like
            }),
            "css" => Some(Syntax {
                line_comment: None,
                ..c_like
            }),
            "json" => Some(Syntax {
                line_comment: None,
                block_comment: false,
                backtick_strings: false,
                single_quote_strings: false,
                triple_quote_strings: false,
            }),
            "python" => Some(Syntax {
                line_comment: Some("#"),
                block_comment: false,
                backtick_strings: false,
                single_quote_strings: true,
                triple_quote_strings: true,
            }),
            _ => None,
        }
    }
}

/// Match `()[]{}` outside strings and comments. Returns the line and a
/// message for the first problem found.
fn check_delimiters(content: &str, syntax: Syntax) -> Result<(), (usize, String)> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    let starts_with = |i: usize, pat: &str| pat.chars().enumerate().all(|(k, c)| chars.get(i + k) == Some(&c));

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if let Some(lc) = syntax.line_comment {
            if starts_with(i, lc) {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
        }
        if syntax.block_comment && starts_with(i, "/*") {
            let start = line;
            i += 2;
            while i < chars.len() && !starts_with(i, "*/") {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err((start, "unterminated block comment".into()));
            }
            i += 2;
            continue;
        }
        if syntax.triple_quote_strings && (starts_with(i, "\"\"\"") || starts_with(i, "'''")) {
            let delim: String = std::iter::repeat(c).take(3).collect();
            let start = line;
            i += 3;
            while i < chars.len() && !starts_with(i, delim.as_str()) {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err((start, "unterminated triple-quoted string".into()));
            }
            i += 3;
            continue;
        }
        let is_quote = c == '"'
            || (c == '\'' && syntax.single_quote_strings)
            || (c == '`' && syntax.backtick_strings);
        if is_quote {
            let start = line;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                } else if chars[i] == '\n' {
                    if c != '`' {
                        return Err((start, format!("unterminated string starting with {}", c)));
                    }
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err((start, format!("unterminated string starting with {}", c)));
            }
            i += 1;
            continue;
        }
        match c {
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err((
                            line,
                            format!("'{}' does not match '{}' opened on line {}", c, open, open_line),
                        ))
                    }
                    None => return Err((line, format!("unmatched '{}'", c))),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err((open_line, format!("unclosed '{}'", open))),
        None => Ok(()),
    }
}

/// Turn linter output into diagnostics. A failing command with no
/// recognizable lines still yields one error.
pub fn classify_lint_output(tool: &str, exit_code: Option<i32>, output: &str) -> Vec<Diagnostic> {
    let mut out: Vec<Diagnostic> = output
        .lines()
        .filter_map(|l| {
            let lower = l.to_ascii_lowercase();
            let severity = if lower.contains("error") {
                Severity::Error
            } else if lower.contains("warning") || lower.contains("warn ") {
                Severity::Warning
            } else {
                return None;
            };
            // Summary lines such as "0 errors" carry no finding.
            if lower.trim_start().starts_with("0 error") || lower.contains(" 0 errors") {
                return None;
            }
            Some(diagnostic(severity, line_number(l), l.trim(), tool))
        })
        .collect();

    if exit_code != Some(0) && !out.iter().any(|d| d.severity == Severity::Error) {
        let lines: Vec<&str> = output.lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        out.push(diagnostic(
            Severity::Error,
            None,
            format!("{} exited with {:?}: {}", tool, exit_code, tail.trim()),
            tool,
        ));
    }
    out
}

pub fn timed_out(tool: &str, limit: std::time::Duration) -> Diagnostic {
    diagnostic(Severity::Error, None, format!("{} timed out after {:?}", tool, limit), tool)
}

/// First `:<line>:` or `(<line>,` style location in a lint line.
fn line_number(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b':' || b == b'(' {
            let digits: String = text[i + 1..].chars().take_while(|c| c.is_ascii_digit()).collect();
            let next = text[i + 1 + digits.len()..].chars().next();
            if !digits.is_empty() && matches!(next, Some(':') | Some(',')) {
                return digits.parse().ok();
            }
        }
    }
    None
}
