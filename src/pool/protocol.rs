//! Newline-delimited JSON spoken between the pool and isolated workers

use crate::errors::{ProtocolError, TaskError};
use crate::parser::SyntaxTree;
use crate::task::{TaskId, TaskOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub file_path: PathBuf,
    pub content: String,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    Completed {
        task_id: TaskId,
        tree: SyntaxTree,
    },
    Failed {
        task_id: TaskId,
        error: TaskError,
    },
}

impl WorkerResponse {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Completed { task_id, .. } | Self::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Serialize one message as a single line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::AnalysisDepth;

    #[test]
    fn test_request_is_one_line() {
        let request = WorkerRequest {
            task_id: TaskId::from_raw(7),
            file_path: PathBuf::from("main.go"),
            content: "package main\n\nfunc main() {}\n".to_string(),
            options: TaskOptions {
                language: None,
                depth: Some(AnalysisDepth::Minimal),
            },
        };
        let line = encode_line(&request).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"depth\":\"minimal\""));
        assert_eq!(decode_line::<WorkerRequest>(&line).unwrap(), request);
    }

    #[test]
    fn test_failure_carries_typed_error() {
        let line = r#"{"type":"failed","task_id":3,"error":{"kind":"parse-failure","detail":"bad.py: eof"}}"#;
        let response: WorkerResponse = decode_line(line).unwrap();
        assert_eq!(response.task_id(), TaskId::from_raw(3));
        assert_eq!(
            response,
            WorkerResponse::Failed {
                task_id: TaskId::from_raw(3),
                error: TaskError::ParseFailure("bad.py: eof".to_string()),
            }
        );
    }

    #[test]
    fn test_malformed_line() {
        let err = decode_line::<WorkerResponse>("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
