//! Per-language parsing behind a single trait
//!
//! Parsers produce a flat declaration outline; [`analyze_source`] shapes it
//! into a [`SyntaxTree`] according to the requested [`AnalysisDepth`].

mod outline;
mod patterns;
mod python;

pub use outline::OutlineParser;
pub use patterns::{scan_patterns, PatternKind, PatternMatch};
pub use python::PythonParser;

use crate::errors::TaskError;
use crate::language::Language;
use crate::monitor::AnalysisDepth;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Module,
    Function,
    Class,
    Import,
    Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstNode {
    pub kind: NodeKind,
    pub name: String,
    /// 1-based
    pub line: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn new(kind: NodeKind, name: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            name: name.into(),
            line,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<AstNode>) -> Self {
        self.children = children;
        self
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(AstNode::count).sum::<usize>()
    }
}

/// Raw parser output before depth shaping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSource {
    pub nodes: Vec<AstNode>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxTree {
    pub language: Language,
    pub path: PathBuf,
    pub depth: AnalysisDepth,
    pub root: AstNode,
    pub node_count: usize,
    /// Present at full depth only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    /// Present at full depth only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<PatternMatch>>,
}

pub trait LanguageParser: Send + Sync {
    fn language(&self) -> Language;

    fn parse(&self, path: &Path, content: &str) -> Result<ParsedSource, TaskError>;
}

pub fn create_parser(language: Language) -> Arc<dyn LanguageParser> {
    match language {
        Language::Python => Arc::new(PythonParser),
        other => Arc::new(OutlineParser::new(other)),
    }
}

/// Parse `content` and shape the result for `depth`.
///
/// A disabled depth fails with [`TaskError::AnalysisDisabled`] without parsing.
pub fn analyze_source(
    parser: &dyn LanguageParser,
    path: &Path,
    content: &str,
    depth: AnalysisDepth,
) -> Result<SyntaxTree, TaskError> {
    if depth == AnalysisDepth::Disabled {
        return Err(disabled_error(path));
    }

    let parsed = parser.parse(path, content)?;
    let language = parser.language();

    let (nodes, dependencies, patterns) = match depth {
        AnalysisDepth::Full => (
            parsed.nodes,
            Some(parsed.dependencies),
            Some(scan_patterns(language, content)),
        ),
        AnalysisDepth::Reduced => (parsed.nodes, None, None),
        _ => (
            parsed
                .nodes
                .into_iter()
                .map(|node| AstNode { children: Vec::new(), ..node })
                .collect(),
            None,
            None,
        ),
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let root = AstNode::new(NodeKind::Module, name, 1).with_children(nodes);

    Ok(SyntaxTree {
        language,
        path: path.to_path_buf(),
        depth,
        node_count: root.count(),
        root,
        dependencies,
        patterns,
    })
}

pub fn disabled_error(path: &Path) -> TaskError {
    TaskError::AnalysisDisabled(format!(
        "analysis of {} disabled under critical resource pressure",
        path.display()
    ))
}

/// Byte offset to 1-based line lookup.
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(content: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(content.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { starts }
    }

    pub(crate) fn line(&self, offset: usize) -> u32 {
        self.starts.partition_point(|&start| start <= offset) as u32
    }
}
