//! Script well-formedness checking for the `check_syntax` tool.
//!
//! A single-pass scanner over the script text: string and here-string
//! tracking, comment skipping, and a bracket stack. It parses nothing and
//! runs nothing; it only answers "would the shell reject this outright".

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntaxReport {
    pub ok: bool,
    pub issues: Vec<SyntaxIssue>,
    pub parser: &'static str,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    /// `@" ... "@` or `@' ... '@`, closing marker must start a line.
    HereString(char),
}

pub fn check_script(script: &str) -> SyntaxReport {
    let started = Instant::now();
    let mut issues = Vec::new();

    let mut mode = Mode::Code;
    let mut mode_opened_at = (1usize, 1usize);
    let mut stack: Vec<(char, usize, usize)> = Vec::new();

    let mut line = 1usize;
    let mut column = 0usize;
    let mut at_line_start = true;

    let chars: Vec<char> = script.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '\n' {
            line += 1;
            column = 0;
            if mode == Mode::LineComment {
                mode = Mode::Code;
            }
            at_line_start = true;
            i += 1;
            continue;
        }
        column += 1;
        let starts_line = at_line_start && !c.is_whitespace();
        if !c.is_whitespace() {
            at_line_start = false;
        }

        match mode {
            Mode::Code => match c {
                '#' => mode = Mode::LineComment,
                '<' if next == Some('#') => {
                    mode = Mode::BlockComment;
                    mode_opened_at = (line, column);
                    i += 1;
                    column += 1;
                }
                '@' if matches!(next, Some('"') | Some('\'')) => {
                    mode = Mode::HereString(next.unwrap_or('"'));
                    mode_opened_at = (line, column);
                    i += 1;
                    column += 1;
                }
                '\'' => {
                    mode = Mode::SingleQuote;
                    mode_opened_at = (line, column);
                }
                '"' => {
                    mode = Mode::DoubleQuote;
                    mode_opened_at = (line, column);
                }
                '`' => {
                    // Backtick escapes the next character, newline included.
                    if next == Some('\n') {
                        line += 1;
                        column = 0;
                        at_line_start = true;
                    }
                    i += 1;
                }
                '(' | '{' | '[' => stack.push((c, line, column)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, ..)) if open == expected => {}
                        Some((open, open_line, open_col)) => issues.push(SyntaxIssue {
                            line,
                            column,
                            message: format!(
                                "mismatched '{c}': closest open is '{open}' at {open_line}:{open_col}"
                            ),
                        }),
                        None => issues.push(SyntaxIssue {
                            line,
                            column,
                            message: format!("unmatched closing '{c}'"),
                        }),
                    }
                }
                _ => {}
            },
            Mode::SingleQuote => {
                if c == '\'' {
                    // '' is an escaped quote inside a single-quoted string.
                    if next == Some('\'') {
                        i += 1;
                        column += 1;
                    } else {
                        mode = Mode::Code;
                    }
                }
            }
            Mode::DoubleQuote => match c {
                '`' => {
                    i += 1;
                    column += 1;
                }
                '"' => {
                    if next == Some('"') {
                        i += 1;
                        column += 1;
                    } else {
                        mode = Mode::Code;
                    }
                }
                _ => {}
            },
            Mode::LineComment => {}
            Mode::BlockComment => {
                if c == '#' && next == Some('>') {
                    mode = Mode::Code;
                    i += 1;
                    column += 1;
                }
            }
            Mode::HereString(quote) => {
                if starts_line && c == quote && next == Some('@') {
                    mode = Mode::Code;
                    i += 1;
                    column += 1;
                }
            }
        }
        i += 1;
    }

    match mode {
        Mode::Code | Mode::LineComment => {}
        Mode::SingleQuote => issues.push(unclosed("single-quoted string", mode_opened_at)),
        Mode::DoubleQuote => issues.push(unclosed("double-quoted string", mode_opened_at)),
        Mode::BlockComment => issues.push(unclosed("block comment", mode_opened_at)),
        Mode::HereString(_) => issues.push(unclosed("here-string", mode_opened_at)),
    }
    for (open, open_line, open_col) in stack {
        issues.push(SyntaxIssue {
            line: open_line,
            column: open_col,
            message: format!("unclosed '{open}'"),
        });
    }

    SyntaxReport {
        ok: issues.is_empty(),
        issues,
        parser: "internal",
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn unclosed(what: &str, opened_at: (usize, usize)) -> SyntaxIssue {
    SyntaxIssue {
        line: opened_at.0,
        column: opened_at.1,
        message: format!("unclosed {what}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_script_passes() {
        let report = check_script("Get-ChildItem | Where-Object { $_.Length -gt 10 }\n");
        assert!(report.ok, "{:?}", report.issues);
        assert_eq!(report.parser, "internal");
    }

    #[test]
    fn test_unclosed_brace_reported() {
        let report = check_script("if ($x) { Get-Date\n");
        assert!(!report.ok);
        assert!(report.issues[0].message.contains("unclosed '{'"));
    }

    #[test]
    fn test_mismatched_bracket_reported() {
        let report = check_script("$a = (1, 2]\n");
        assert!(!report.ok);
        assert!(report.issues[0].message.contains("mismatched"));
    }

    #[test]
    fn test_unterminated_string_reported() {
        let report = check_script("Write-Output \"hello\n");
        assert!(!report.ok);
        assert!(report.issues[0].message.contains("double-quoted string"));
        assert_eq!(report.issues[0].line, 1);
    }

    #[test]
    fn test_escaped_single_quote() {
        let report = check_script("Write-Output 'it''s fine'\n");
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_brackets_inside_strings_ignored() {
        let report = check_script("Write-Output \"({[\"\n");
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_line_comment_ignores_rest_of_line() {
        let report = check_script("Get-Date # comment with ( and {\nGet-Date\n");
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_block_comment() {
        let report = check_script("<# comment ( { [ #>\nGet-Date\n");
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_unclosed_block_comment() {
        let report = check_script("<# runs forever\nGet-Date\n");
        assert!(!report.ok);
        assert!(report.issues[0].message.contains("block comment"));
    }

    #[test]
    fn test_here_string_swallows_quotes_and_brackets() {
        let script = "@\"\nanything ( { [ \" goes\n\"@\nGet-Date\n";
        let report = check_script(script);
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_unclosed_here_string() {
        let report = check_script("@\"\nnever closed\n");
        assert!(!report.ok);
        assert!(report.issues[0].message.contains("here-string"));
    }

    #[test]
    fn test_backtick_escapes_quote_in_double_string() {
        let report = check_script("Write-Output \"a `\" b\"\n");
        assert!(report.ok, "{:?}", report.issues);
    }
}
