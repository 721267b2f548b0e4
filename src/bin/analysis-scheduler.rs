use analysis_scheduler::infrastructure::{init_logging, LogConfig};
use analysis_scheduler::pool::run_stdio_worker;
use analysis_scheduler::{
    AnalysisRequest, Event, Language, LoadLevel, PerformanceConfig, PerformanceManager,
    RelevanceContext, Result, SubmitStatus, TaskId,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

const USAGE: &str = "Usage: analysis-scheduler <command>\n\nCommands:\n  \
     analyze [--config FILE] [--level LEVEL] <file>...  Analyze files and print statistics\n  \
     config                                            Print the default configuration\n  \
     worker <language>                                 Serve analysis requests on stdin/stdout";

#[derive(Debug, Default)]
struct AnalyzeArgs {
    config: Option<PathBuf>,
    level: Option<LoadLevel>,
    files: Vec<PathBuf>,
}

enum Command {
    Analyze(AnalyzeArgs),
    Config,
    Worker(Language),
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Err(USAGE.to_string());
    };

    match command.as_str() {
        "config" => Ok(Command::Config),
        "worker" => {
            let name = args
                .get(2)
                .ok_or_else(|| "worker requires a language".to_string())?;
            Language::from_name(name)
                .map(Command::Worker)
                .ok_or_else(|| format!("Unknown language: {}", name))
        }
        "analyze" => {
            let mut parsed = AnalyzeArgs::default();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--config" => {
                        i += 1;
                        let path = args.get(i).ok_or("--config requires a file")?;
                        parsed.config = Some(PathBuf::from(path));
                    }
                    "--level" => {
                        i += 1;
                        let name = args.get(i).ok_or("--level requires a level")?;
                        parsed.level = Some(
                            LoadLevel::from_name(name)
                                .ok_or_else(|| format!("Unknown level: {}", name))?,
                        );
                    }
                    arg if arg.starts_with("--") => {
                        return Err(format!("Unknown option: {}", arg));
                    }
                    file => parsed.files.push(PathBuf::from(file)),
                }
                i += 1;
            }
            if parsed.files.is_empty() {
                return Err("No files specified".to_string());
            }
            Ok(Command::Analyze(parsed))
        }
        "-h" | "--help" | "help" => Err(USAGE.to_string()),
        other => Err(format!("Unknown command: {}\n\n{}", other, USAGE)),
    }
}

async fn analyze(args: AnalyzeArgs) -> Result<i32> {
    let config = match &args.config {
        Some(path) => PerformanceConfig::load(path)?,
        None => PerformanceConfig::default(),
    };
    let deadline = config.pool.worker_timeout * 2 + Duration::from_secs(5);

    let manager = PerformanceManager::new(config);
    let events = manager.subscribe();
    manager.initialize()?;
    if let Some(level) = args.level {
        manager.set_performance_level(level);
    }

    let context = RelevanceContext {
        is_currently_open: true,
        ..RelevanceContext::default()
    };
    let mut pending: HashSet<TaskId> = HashSet::new();
    let mut exit_code = 0;

    for file in &args.files {
        let content = match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                exit_code = 1;
                continue;
            }
        };
        let outcome = manager.submit_task(AnalysisRequest::new(file.clone(), content), &context)?;
        match (outcome.status, outcome.task_id) {
            (SubmitStatus::Queued, Some(task_id)) => {
                pending.insert(task_id);
            }
            _ => println!("{}: throttled", file.display()),
        }
    }

    while !pending.is_empty() {
        let event = match tokio::time::timeout(deadline, events.recv_async()).await {
            Ok(Ok(event)) => event,
            _ => {
                eprintln!("Timed out waiting for {} task(s)", pending.len());
                exit_code = 1;
                break;
            }
        };
        match event {
            Event::TaskCompleted {
                task_id,
                file_path,
                tree,
                duration,
                ..
            } if pending.remove(&task_id) => println!(
                "{}: {} nodes at {} depth in {:.2?}",
                file_path.display(),
                tree.node_count,
                tree.depth,
                duration
            ),
            Event::TaskFailed {
                task_id,
                file_path,
                error,
                ..
            } if pending.remove(&task_id) => {
                println!("{}: failed ({})", file_path.display(), error);
                exit_code = 1;
            }
            _ => {}
        }
    }

    let stats = manager.get_performance_statistics().await;
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render statistics: {}", e),
    }
    manager.shutdown().await;
    Ok(exit_code)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let result = match command {
        Command::Config => {
            print!("{}", PerformanceConfig::generate_default());
            Ok(0)
        }
        Command::Worker(language) => {
            // stdout carries the protocol; logs go to stderr
            let _guard = init_logging(LogConfig::new().with_level(Level::WARN));
            run_stdio_worker(language)
                .map(|()| 0)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        }
        Command::Analyze(args) => {
            let _guard = init_logging(LogConfig::new());
            tokio::runtime::Runtime::new()
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                .and_then(|runtime| {
                    runtime
                        .block_on(analyze(args))
                        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                })
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_analyze() {
        let command = parse_args(&args(&[
            "bin", "analyze", "--config", "perf.toml", "--level", "high", "a.py", "b.ts",
        ]))
        .unwrap();
        match command {
            Command::Analyze(parsed) => {
                assert_eq!(parsed.config, Some(PathBuf::from("perf.toml")));
                assert_eq!(parsed.level, Some(LoadLevel::High));
                assert_eq!(parsed.files.len(), 2);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["bin"])).is_err());
        assert!(parse_args(&args(&["bin", "analyze"])).is_err());
        assert!(parse_args(&args(&["bin", "analyze", "--config"])).is_err());
        assert!(parse_args(&args(&["bin", "worker", "cobol"])).is_err());
        assert!(matches!(
            parse_args(&args(&["bin", "worker", "go"])),
            Ok(Command::Worker(Language::Go))
        ));
    }
}
