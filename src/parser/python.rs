use super::{AstNode, LanguageParser, LineIndex, NodeKind, ParsedSource};
use crate::errors::TaskError;
use crate::language::Language;
use rustpython_parser::ast::{Mod, ModModule, Stmt};
use rustpython_parser::{parse, Mode};
use std::path::Path;
use tracing::{debug, instrument};

/// Python parser built on `rustpython-parser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonParser;

impl LanguageParser for PythonParser {
    fn language(&self) -> Language {
        Language::Python
    }

    #[instrument(skip(self, content), fields(source_len = content.len()))]
    fn parse(&self, path: &Path, content: &str) -> Result<ParsedSource, TaskError> {
        let source_path = path.display().to_string();
        let body = match parse(content, Mode::Module, &source_path) {
            Ok(Mod::Module(ModModule { body, .. })) => body,
            Ok(_) => {
                return Err(TaskError::ParseFailure(format!(
                    "{}: expected a module",
                    source_path
                )))
            }
            Err(e) => {
                debug!(error = %e, "Python parse failed");
                return Err(TaskError::ParseFailure(format!("{}: {}", source_path, e)));
            }
        };

        let lines = LineIndex::new(content);
        let mut dependencies = Vec::new();
        let nodes = collect(&body, &lines, &mut dependencies);

        Ok(ParsedSource {
            nodes,
            dependencies,
        })
    }
}

fn collect(body: &[Stmt], lines: &LineIndex, dependencies: &mut Vec<String>) -> Vec<AstNode> {
    let mut nodes = Vec::new();

    for stmt in body {
        match stmt {
            Stmt::FunctionDef(func) => {
                let children = collect(&func.body, lines, dependencies);
                let line = lines.line(func.range.start().to_usize());
                nodes.push(
                    AstNode::new(NodeKind::Function, func.name.to_string(), line).with_children(children),
                );
            }
            Stmt::AsyncFunctionDef(func) => {
                let children = collect(&func.body, lines, dependencies);
                let line = lines.line(func.range.start().to_usize());
                nodes.push(
                    AstNode::new(NodeKind::Function, func.name.to_string(), line).with_children(children),
                );
            }
            Stmt::ClassDef(class) => {
                let children = collect(&class.body, lines, dependencies);
                let line = lines.line(class.range.start().to_usize());
                nodes.push(
                    AstNode::new(NodeKind::Class, class.name.to_string(), line).with_children(children),
                );
            }
            Stmt::Import(import) => {
                let line = lines.line(import.range.start().to_usize());
                for alias in &import.names {
                    let module = alias.name.to_string();
                    nodes.push(AstNode::new(NodeKind::Import, module.clone(), line));
                    dependencies.push(module);
                }
            }
            Stmt::ImportFrom(import) => {
                let module = import
                    .module
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| ".".to_string());
                let line = lines.line(import.range.start().to_usize());
                nodes.push(AstNode::new(NodeKind::Import, module.clone(), line));
                dependencies.push(module);
            }
            _ => {}
        }
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations_and_imports() {
        let source = r#"
import os, sys
from collections import OrderedDict

class Store:
    def get(self, key):
        return key

    async def fetch(self):
        pass

def main():
    pass
"#;
        let parsed = PythonParser.parse(Path::new("store.py"), source).unwrap();
        assert_eq!(parsed.dependencies, vec!["os", "sys", "collections"]);

        let class = parsed
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::Class)
            .unwrap();
        assert_eq!(class.name, "Store");
        assert_eq!(class.line, 5);
        let methods: Vec<_> = class.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(methods, vec!["get", "fetch"]);

        let main = parsed.nodes.last().unwrap();
        assert_eq!((main.kind, main.name.as_str(), main.line), (NodeKind::Function, "main", 12));
    }

    #[test]
    fn test_syntax_error_is_parse_failure() {
        let err = PythonParser
            .parse(Path::new("bad.py"), "def broken(:\n")
            .unwrap_err();
        assert!(matches!(err, TaskError::ParseFailure(msg) if msg.starts_with("bad.py")));
    }
}
