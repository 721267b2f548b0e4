//! Worker side of an isolated process unit

use super::protocol::{decode_line, encode_line, WorkerRequest, WorkerResponse};
use crate::config::CacheConfig;
use crate::errors::ProtocolError;
use crate::events::EventBus;
use crate::language::Language;
use crate::lazy::LazyLoadingManager;
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

/// Serve analysis requests on stdin/stdout until stdin closes.
pub fn run_stdio_worker(language: Language) -> Result<(), ProtocolError> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(language, stdin.lock(), stdout.lock())
}

/// Request loop over arbitrary streams.
///
/// Malformed request lines are skipped; the pool times such tasks out.
pub fn serve<R: BufRead, W: Write>(
    language: Language,
    reader: R,
    mut writer: W,
) -> Result<(), ProtocolError> {
    let lazy = LazyLoadingManager::new(CacheConfig::default(), EventBus::new());
    lazy.load_parser(language);
    info!(%language, pid = std::process::id(), "Worker ready");

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut request: WorkerRequest = match decode_line(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };
        if request.options.language.is_none() {
            request.options.language = Some(language);
        }

        debug!(task_id = %request.task_id, path = %request.file_path.display(), "Analyzing");
        let response = match lazy.load_ast(&request.file_path, &request.content, &request.options) {
            Ok(tree) => WorkerResponse::Completed {
                task_id: request.task_id,
                tree: tree.as_ref().clone(),
            },
            Err(error) => WorkerResponse::Failed {
                task_id: request.task_id,
                error,
            },
        };

        writer.write_all(encode_line(&response)?.as_bytes())?;
        writer.flush()?;
    }

    info!(%language, "Worker input closed");
    Ok(())
}
