//! Line-level pattern analysis, run at full depth only

use crate::language::Language;
use serde::{Deserialize, Serialize};

const MARKERS: [&str; 3] = ["TODO", "FIXME", "HACK"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// TODO / FIXME / HACK inside a comment
    MarkerComment,
    /// Leftover debug printing
    DebugOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: PatternKind,
    pub line: u32,
    pub text: String,
}

fn comment_leaders(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &["#"],
        _ => &["//", "/*", "*"],
    }
}

fn debug_calls(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &["print("],
        Language::TypeScript | Language::JavaScript => &["console.log(", "console.debug("],
        Language::Go => &["fmt.Println(", "fmt.Printf("],
        Language::Java => &["System.out.println(", "System.err.println("],
        Language::Rust => &["println!(", "eprintln!(", "dbg!("],
    }
}

/// Scan `content` for marker comments and debug output.
pub fn scan_patterns(language: Language, content: &str) -> Vec<PatternMatch> {
    let leaders = comment_leaders(language);
    let calls = debug_calls(language);
    let mut matches = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = index as u32 + 1;

        let (code, comment) = split_comment(raw, leaders);
        if let Some(comment) = comment {
            if let Some(marker) = MARKERS.iter().find(|m| contains_word(comment, m)) {
                matches.push(PatternMatch {
                    pattern: PatternKind::MarkerComment,
                    line,
                    text: format!("{}: {}", marker, comment.trim()),
                });
            }
        }

        if calls.iter().any(|call| is_call(code, call)) {
            matches.push(PatternMatch {
                pattern: PatternKind::DebugOutput,
                line,
                text: code.trim().to_string(),
            });
        }
    }

    matches
}

/// Split at the first comment leader. String literals are not tracked.
fn split_comment<'a>(line: &'a str, leaders: &[&str]) -> (&'a str, Option<&'a str>) {
    let trimmed = line.trim_start();
    if leaders.iter().any(|l| trimmed.starts_with(l)) {
        return ("", Some(trimmed));
    }

    leaders
        .iter()
        .filter(|l| **l != "*")
        .filter_map(|l| line.find(l))
        .min()
        .map(|at| (&line[..at], Some(&line[at..])))
        .unwrap_or((line, None))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(at, _)| {
        let before = haystack[..at].chars().next_back();
        let after = haystack[at + word.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric() || c == '_')
            && !after.is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

fn is_call(code: &str, call: &str) -> bool {
    code.match_indices(call).any(|(at, _)| {
        !code[..at]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_markers_and_prints() {
        let source = "x = 1  # FIXME: magic\nprint(x)\nreprint(x)\n# TODOS are not markers\n";
        let found = scan_patterns(Language::Python, source);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pattern, PatternKind::MarkerComment);
        assert_eq!(found[0].line, 1);
        assert_eq!(found[1].pattern, PatternKind::DebugOutput);
        assert_eq!(found[1].line, 2);
    }

    #[test]
    fn test_commented_out_debug_is_not_output() {
        let source = "// console.log(state)\nconsole.log(state); // HACK\n";
        let found = scan_patterns(Language::TypeScript, source);
        let kinds: Vec<_> = found.iter().map(|m| (m.pattern, m.line)).collect();
        assert_eq!(
            kinds,
            vec![
                (PatternKind::MarkerComment, 2),
                (PatternKind::DebugOutput, 2),
            ]
        );
    }

    #[test]
    fn test_rust_and_go_calls() {
        assert_eq!(scan_patterns(Language::Rust, "    dbg!(value);").len(), 1);
        assert_eq!(scan_patterns(Language::Go, "\tfmt.Println(\"x\")").len(), 1);
        assert!(scan_patterns(Language::Go, "\tlog.Println(\"x\")").is_empty());
    }
}
