//! Line-based declaration scanner for brace languages
//!
//! Recognizes declarations by leading keywords and nests them by indentation.
//! It does not validate syntax, so it never reports a parse failure.

use super::{AstNode, LanguageParser, NodeKind, ParsedSource};
use crate::errors::TaskError;
use crate::language::Language;
use std::path::Path;
use tracing::instrument;

const MODIFIERS: &[&str] = &[
    "export", "default", "declare", "abstract", "async", "pub", "pub(crate)", "pub(super)",
    "public", "private", "protected", "static", "final", "synchronized", "unsafe", "extern",
];

const CONTROL_WORDS: &[&str] = &[
    "if", "for", "while", "switch", "return", "new", "catch", "else", "do", "try", "throw",
];

#[derive(Debug, Clone, Copy)]
pub struct OutlineParser {
    language: Language,
}

impl OutlineParser {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    fn classify(&self, words: &[&str], rest: &str) -> Option<(NodeKind, String)> {
        let keyword = words.first()?.split(['<', '(']).next()?;
        let after = rest.trim_start().strip_prefix(keyword)?.trim_start();

        let kind = match (self.language, keyword) {
            (Language::TypeScript | Language::JavaScript, "function" | "function*") => {
                NodeKind::Function
            }
            (Language::TypeScript | Language::JavaScript | Language::Java, "class") => {
                NodeKind::Class
            }
            (Language::TypeScript | Language::Java, "interface" | "enum") => NodeKind::Type,
            (Language::TypeScript, "type") => NodeKind::Type,
            (Language::Go, "func") => {
                return identifier(skip_receiver(after)).map(|n| (NodeKind::Function, n));
            }
            (Language::Go, "type") => NodeKind::Type,
            (Language::Rust, "fn") => NodeKind::Function,
            (Language::Rust, "struct" | "enum" | "trait" | "type" | "union") => NodeKind::Type,
            (Language::Rust, "impl") => {
                return impl_target(after).map(|n| (NodeKind::Class, n));
            }
            (Language::Rust, "mod") => NodeKind::Module,
            (Language::Java, _) if rest.contains('(') && !CONTROL_WORDS.contains(&keyword) => {
                return java_method(rest).map(|n| (NodeKind::Function, n));
            }
            _ => return None,
        };

        identifier(after).map(|name| (kind, name))
    }

    fn import_target(&self, line: &str) -> Option<String> {
        match self.language {
            Language::TypeScript | Language::JavaScript => {
                let reexport = line.starts_with("export ") && line.contains(" from ");
                if line.starts_with("import ") || reexport {
                    quoted(line.rsplit_once(" from ").map_or(line, |(_, src)| src))
                } else if let Some(at) = line.find("require(") {
                    quoted(&line[at..])
                } else {
                    None
                }
            }
            Language::Go => line.strip_prefix("import ").and_then(quoted),
            Language::Java => line.strip_prefix("import ").map(|target| {
                target
                    .trim_start_matches("static ")
                    .trim_end_matches(';')
                    .trim()
                    .to_string()
            }),
            Language::Rust => line
                .strip_prefix("use ")
                .or_else(|| line.strip_prefix("pub use "))
                .map(|target| target.trim_end_matches(';').trim().to_string()),
            Language::Python => None,
        }
    }
}

impl LanguageParser for OutlineParser {
    fn language(&self) -> Language {
        self.language
    }

    #[instrument(skip(self, content), fields(language = %self.language, source_len = content.len()))]
    fn parse(&self, _path: &Path, content: &str) -> Result<ParsedSource, TaskError> {
        let mut builder = TreeBuilder::default();
        let mut dependencies = Vec::new();
        let mut in_import_block = false;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index as u32 + 1;
            let indent = raw.len() - raw.trim_start().len();
            let line = raw.trim();

            let comment = line.starts_with("//") || line.starts_with("/*") || line.starts_with('*');
            if line.is_empty() || comment {
                continue;
            }

            // Go: import ( "a" "b" )
            if in_import_block {
                if line.starts_with(')') {
                    in_import_block = false;
                } else if let Some(target) = quoted(line) {
                    builder.push(indent, AstNode::new(NodeKind::Import, target.clone(), line_no));
                    dependencies.push(target);
                }
                continue;
            }
            if self.language == Language::Go && line.starts_with("import (") {
                in_import_block = true;
                continue;
            }

            if let Some(target) = self.import_target(line) {
                builder.push(indent, AstNode::new(NodeKind::Import, target.clone(), line_no));
                dependencies.push(target);
                continue;
            }

            let stripped = strip_modifiers(line);
            let words: Vec<&str> = stripped.split_whitespace().collect();
            if let Some((kind, name)) = self.classify(&words, stripped) {
                builder.push(indent, AstNode::new(kind, name, line_no));
            }
        }

        Ok(ParsedSource {
            nodes: builder.finish(),
            dependencies,
        })
    }
}

/// Nests nodes under the nearest preceding declaration with smaller indent.
#[derive(Default)]
struct TreeBuilder {
    roots: Vec<AstNode>,
    open: Vec<(usize, AstNode)>,
}

impl TreeBuilder {
    fn push(&mut self, indent: usize, node: AstNode) {
        while self.open.last().is_some_and(|(open_indent, _)| *open_indent >= indent) {
            self.close_last();
        }
        self.open.push((indent, node));
    }

    fn close_last(&mut self) {
        if let Some((_, node)) = self.open.pop() {
            match self.open.last_mut() {
                Some((_, parent)) => parent.children.push(node),
                None => self.roots.push(node),
            }
        }
    }

    fn finish(mut self) -> Vec<AstNode> {
        while !self.open.is_empty() {
            self.close_last();
        }
        self.roots
    }
}

fn strip_modifiers(mut line: &str) -> &str {
    loop {
        let next = MODIFIERS.iter().find_map(|m| {
            line.strip_prefix(m)
                .filter(|rest| rest.starts_with(char::is_whitespace))
                .map(str::trim_start)
        });
        match next {
            Some(rest) => line = rest,
            None => return line,
        }
    }
}

fn identifier(text: &str) -> Option<String> {
    let name: String = text
        .chars()
        .skip_while(|c| *c == '*')
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect();
    (!name.is_empty()).then_some(name)
}

fn skip_receiver(after_func: &str) -> &str {
    if after_func.starts_with('(') {
        after_func
            .find(')')
            .map_or(after_func, |end| after_func[end + 1..].trim_start())
    } else {
        after_func
    }
}

/// `impl<T> Trait for Type<T>` names `Type`.
fn impl_target(after_impl: &str) -> Option<String> {
    let mut text = after_impl;
    if text.starts_with('<') {
        text = text.find('>').map_or(text, |end| text[end + 1..].trim_start());
    }
    let text = text.split_once(" for ").map_or(text, |(_, target)| target.trim_start());
    identifier(text)
}

fn java_method(line: &str) -> Option<String> {
    let before_paren = line[..line.find('(')?].trim_end();
    if before_paren.contains('=') || !before_paren.contains(char::is_whitespace) {
        return None;
    }
    identifier(before_paren.rsplit(char::is_whitespace).next()?)
}

fn quoted(text: &str) -> Option<String> {
    let start = text.find(['"', '\'', '`'])?;
    let quote = text[start..].chars().next()?;
    let body = &text[start + 1..];
    let end = body.find(quote)?;
    Some(body[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline(language: Language, source: &str) -> ParsedSource {
        OutlineParser::new(language)
            .parse(Path::new("input"), source)
            .unwrap()
    }

    fn names(nodes: &[AstNode]) -> Vec<(NodeKind, &str)> {
        nodes.iter().map(|n| (n.kind, n.name.as_str())).collect()
    }

    #[test]
    fn test_typescript_outline() {
        let source = r#"import { readFile } from "fs";
const util = require('./util');

export interface Options {
  depth: number;
}

export default class Runner {
  async run() {}
}

export async function main(args: string[]) {
  console.log(args);
}
"#;
        let parsed = outline(Language::TypeScript, source);
        assert_eq!(parsed.dependencies, vec!["fs", "./util"]);
        assert_eq!(
            names(&parsed.nodes),
            vec![
                (NodeKind::Import, "fs"),
                (NodeKind::Import, "./util"),
                (NodeKind::Type, "Options"),
                (NodeKind::Class, "Runner"),
                (NodeKind::Function, "main"),
            ]
        );
        assert_eq!(parsed.nodes[4].line, 12);
    }

    #[test]
    fn test_go_outline() {
        let source = "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\ntype Server struct {\n}\n\nfunc (s *Server) Serve() error {\n\treturn nil\n}\n\nfunc main() {\n}\n";
        let parsed = outline(Language::Go, source);
        assert_eq!(parsed.dependencies, vec!["fmt", "os"]);
        assert_eq!(
            names(&parsed.nodes),
            vec![
                (NodeKind::Import, "fmt"),
                (NodeKind::Import, "os"),
                (NodeKind::Type, "Server"),
                (NodeKind::Function, "Serve"),
                (NodeKind::Function, "main"),
            ]
        );
    }

    #[test]
    fn test_rust_nesting() {
        let source = "use std::fmt;\n\npub struct Cache;\n\nimpl<K> Default for Cache<K> {\n    fn default() -> Self {\n        Self\n    }\n}\n\npub(crate) fn helper() {}\n";
        let parsed = outline(Language::Rust, source);
        assert_eq!(parsed.dependencies, vec!["std::fmt"]);
        assert_eq!(
            names(&parsed.nodes),
            vec![
                (NodeKind::Import, "std::fmt"),
                (NodeKind::Type, "Cache"),
                (NodeKind::Class, "Cache"),
                (NodeKind::Function, "helper"),
            ]
        );
        assert_eq!(names(&parsed.nodes[2].children), vec![(NodeKind::Function, "default")]);
    }

    #[test]
    fn test_java_methods() {
        let source = "import java.util.List;\n\npublic class Service {\n    public List<String> names(int limit) {\n        if (limit > 0) {\n        }\n        return null;\n    }\n}\n";
        let parsed = outline(Language::Java, source);
        assert_eq!(parsed.dependencies, vec!["java.util.List"]);
        let class = &parsed.nodes[1];
        assert_eq!((class.kind, class.name.as_str()), (NodeKind::Class, "Service"));
        assert_eq!(names(&class.children), vec![(NodeKind::Function, "names")]);
    }
}
