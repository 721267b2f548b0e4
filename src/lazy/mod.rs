//! Lazy parser and AST loading with pressure-driven eviction
//!
//! Two independent bounded caches: parsers keyed by language and syntax
//! trees keyed by normalized path, content hash and depth. Degradation
//! changes from the resource monitor set the depth used for every later load
//! and, on upward moves, evict about half of each cache.

mod cache;

pub use cache::{BoundedCache, CacheStatistics};

use crate::config::CacheConfig;
use crate::errors::TaskError;
use crate::events::{Event, EventBus};
use crate::language::Language;
use crate::monitor::{AnalysisDepth, DegradationLevel, ResourceMonitor};
use crate::parser::{analyze_source, create_parser, disabled_error, LanguageParser, SyntaxTree};
use crate::task::TaskOptions;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Content hash for change detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(content: &str) -> Self {
        Self(*blake3::hash(content.as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AstKey {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub depth: AnalysisDepth,
}

impl AstKey {
    pub fn new(path: &Path, content: &str, depth: AnalysisDepth) -> Self {
        Self {
            path: normalize_path(path),
            hash: ContentHash::of(content),
            depth,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LazyCacheStatistics {
    pub parsers: CacheStatistics,
    pub asts: CacheStatistics,
    pub current_depth: AnalysisDepth,
    pub memory_pressure_responses: u64,
    pub cleanups: u64,
}

struct LazyInner {
    config: CacheConfig,
    events: EventBus,
    parsers: Mutex<BoundedCache<Language, Arc<dyn LanguageParser>>>,
    asts: Mutex<BoundedCache<AstKey, Arc<SyntaxTree>>>,
    depth: RwLock<AnalysisDepth>,
    background: Mutex<Vec<JoinHandle<()>>>,
    pressure_responses: AtomicU64,
    cleanups: AtomicU64,
}

/// Parser and AST cache shared by in-process workers.
#[derive(Clone)]
pub struct LazyLoadingManager {
    inner: Arc<LazyInner>,
}

impl LazyLoadingManager {
    pub fn new(config: CacheConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(LazyInner {
                parsers: Mutex::new(BoundedCache::new(config.max_cached_parsers)),
                asts: Mutex::new(BoundedCache::new(config.max_cached_asts)),
                config,
                events,
                depth: RwLock::new(AnalysisDepth::Full),
                background: Mutex::new(Vec::new()),
                pressure_responses: AtomicU64::new(0),
                cleanups: AtomicU64::new(0),
            }),
        }
    }

    /// Follow `monitor`'s degradation changes and start the idle-cleanup timer.
    pub fn initialize(&self, monitor: &ResourceMonitor) {
        let mut background = self.inner.background.lock();
        if !background.is_empty() {
            return;
        }

        *self.inner.depth.write() = monitor.get_recommended_analysis_depth();

        let degradation = monitor.subscribe();
        let manager = self.clone();
        background.push(tokio::spawn(async move {
            while let Ok(event) = degradation.recv_async().await {
                if let Event::DegradationChanged {
                    old_level,
                    new_level,
                    ..
                } = event
                {
                    manager.respond_to_degradation(old_level, new_level);
                }
            }
        }));

        let manager = self.clone();
        let period = self.inner.config.cleanup_interval.max(Duration::from_millis(1));
        let max_idle = self.inner.config.max_idle_time;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                manager.schedule_cleanup(max_idle);
            }
        }));

        info!(
            max_cached_parsers = self.inner.config.max_cached_parsers,
            max_cached_asts = self.inner.config.max_cached_asts,
            "Lazy loading manager initialized"
        );
    }

    pub fn current_depth(&self) -> AnalysisDepth {
        *self.inner.depth.read()
    }

    pub fn load_parser(&self, language: Language) -> Arc<dyn LanguageParser> {
        let cached = self.inner.parsers.lock().get(&language);
        let parser = match cached {
            Some(parser) => {
                self.inner.events.publish(Event::ParserCacheHit { language });
                parser
            }
            None => {
                let parser = create_parser(language);
                let evicted = self.inner.parsers.lock().insert(language, Arc::clone(&parser));
                debug!(%language, "Parser loaded");
                self.inner.events.publish(Event::ParserLoaded { language });
                if let Some((evicted, _)) = evicted {
                    self.inner.events.publish(Event::ParserUnloaded { language: evicted });
                }
                parser
            }
        };

        let depth = self.current_depth();
        if depth != AnalysisDepth::Full {
            self.inner
                .events
                .publish(Event::ParserReducedComplexity { language, depth });
        }
        parser
    }

    /// Analyze one file at the more restrictive of the requested and current depth.
    ///
    /// Fails with [`TaskError::AnalysisDisabled`] while analysis is disabled.
    #[instrument(skip(self, content, options), fields(path = %path.display()))]
    pub fn load_ast(
        &self,
        path: &Path,
        content: &str,
        options: &TaskOptions,
    ) -> Result<Arc<SyntaxTree>, TaskError> {
        let depth = options
            .depth
            .unwrap_or(AnalysisDepth::Full)
            .most_restrictive(self.current_depth());
        if depth == AnalysisDepth::Disabled {
            return Err(disabled_error(path));
        }

        let language = options
            .language
            .or_else(|| Language::from_path(path))
            .ok_or_else(|| TaskError::UnsupportedLanguage(path.display().to_string()))?;

        let key = AstKey::new(path, content, depth);
        let cached = self.inner.asts.lock().get(&key);
        if let Some(tree) = cached {
            self.inner.events.publish(Event::AstCacheHit {
                file_path: path.to_path_buf(),
            });
            return Ok(tree);
        }

        let parser = self.load_parser(language);
        let tree = Arc::new(analyze_source(parser.as_ref(), path, content, depth)?);

        self.inner.asts.lock().insert(key, Arc::clone(&tree));
        self.inner.events.publish(Event::AstLoaded {
            file_path: path.to_path_buf(),
            depth,
        });
        Ok(tree)
    }

    /// Evict entries idle for at least `max_age`. Returns how many were removed.
    pub fn schedule_cleanup(&self, max_age: Duration) -> usize {
        let parsers = self.inner.parsers.lock().evict_idle(max_age);
        let asts = self.inner.asts.lock().evict_idle(max_age).len();
        let removed = parsers.len() + asts;

        for language in parsers {
            self.inner.events.publish(Event::ParserUnloaded { language });
        }
        self.inner.cleanups.fetch_add(1, Ordering::Relaxed);
        debug!(removed, "Cache cleanup completed");
        self.inner.events.publish(Event::CleanupCompleted { removed });
        removed
    }

    pub fn unload_parser(&self, language: Language) -> bool {
        let removed = self.inner.parsers.lock().remove(&language).is_some();
        if removed {
            self.inner.events.publish(Event::ParserUnloaded { language });
        }
        removed
    }

    /// Adopt the depth for `new` and relieve pressure on upward moves.
    pub fn respond_to_degradation(&self, old: DegradationLevel, new: DegradationLevel) {
        *self.inner.depth.write() = new.analysis_depth();
        if new <= old {
            debug!(level = new.as_u8(), "Degradation eased, caches kept");
            return;
        }

        let parsers_evicted = {
            let mut parsers = self.inner.parsers.lock();
            let half = parsers.len().div_ceil(2);
            parsers.evict_lru(half)
        };
        let asts_evicted = {
            let mut asts = self.inner.asts.lock();
            let half = asts.len().div_ceil(2);
            asts.evict_lru(half).len()
        };

        self.inner.pressure_responses.fetch_add(1, Ordering::Relaxed);
        info!(
            level = new.as_u8(),
            parsers_evicted = parsers_evicted.len(),
            asts_evicted,
            "Relieved cache pressure"
        );
        for language in &parsers_evicted {
            self.inner.events.publish(Event::ParserUnloaded { language: *language });
        }
        self.inner.events.publish(Event::MemoryPressureResponse {
            level: new,
            parsers_evicted: parsers_evicted.len(),
            asts_evicted,
        });
    }

    pub fn get_cache_statistics(&self) -> LazyCacheStatistics {
        LazyCacheStatistics {
            parsers: self.inner.parsers.lock().statistics(),
            asts: self.inner.asts.lock().statistics(),
            current_depth: self.current_depth(),
            memory_pressure_responses: self.inner.pressure_responses.load(Ordering::Relaxed),
            cleanups: self.inner.cleanups.load(Ordering::Relaxed),
        }
    }

    /// Stop background work and release both caches.
    pub fn shutdown(&self) {
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        self.inner.parsers.lock().clear();
        self.inner.asts.lock().clear();
        info!("Lazy loading manager shut down");
    }
}

impl std::fmt::Debug for LazyLoadingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyLoadingManager")
            .field("depth", &self.current_depth())
            .finish()
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::StaticSampler;

    const PY: &str = "import os\n\ndef main():\n    print(os.getcwd())\n";

    fn manager(events: &EventBus) -> LazyLoadingManager {
        LazyLoadingManager::new(CacheConfig::default(), events.clone())
    }

    #[test]
    fn test_ast_cache_hit_on_same_content() {
        let events = EventBus::new();
        let rx = events.subscribe();
        let lazy = manager(&events);
        let options = TaskOptions::default();

        let first = lazy.load_ast(Path::new("./src/app.py"), PY, &options).unwrap();
        let second = lazy.load_ast(Path::new("src/app.py"), PY, &options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let names: Vec<_> = rx.try_iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["parser:loaded", "ast:loaded", "ast:cache-hit"]);
    }

    #[test]
    fn test_changed_content_misses_cache() {
        let lazy = manager(&EventBus::new());
        let options = TaskOptions::default();
        let first = lazy.load_ast(Path::new("a.py"), PY, &options).unwrap();
        let second = lazy
            .load_ast(Path::new("a.py"), "def other():\n    pass\n", &options)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(lazy.get_cache_statistics().asts.size, 2);
    }

    #[test]
    fn test_requested_depth_is_honored() {
        let lazy = manager(&EventBus::new());
        let options = TaskOptions {
            language: None,
            depth: Some(AnalysisDepth::Reduced),
        };
        let tree = lazy.load_ast(Path::new("a.py"), PY, &options).unwrap();
        assert_eq!(tree.depth, AnalysisDepth::Reduced);
        assert!(tree.patterns.is_none());
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let lazy = manager(&EventBus::new());
        let err = lazy
            .load_ast(Path::new("notes.txt"), "", &TaskOptions::default())
            .unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedLanguage(_)));
    }

    #[test]
    fn test_parse_failure_is_not_cached() {
        let lazy = manager(&EventBus::new());
        let result = lazy.load_ast(Path::new("bad.py"), "def (:\n", &TaskOptions::default());
        assert!(matches!(result, Err(TaskError::ParseFailure(_))));
        assert_eq!(lazy.get_cache_statistics().asts.size, 0);
    }

    #[test]
    fn test_upward_degradation_evicts_half_and_sets_depth() {
        let events = EventBus::new();
        let lazy = manager(&events);
        for i in 0..4 {
            lazy.load_ast(Path::new(&format!("m{}.py", i)), PY, &TaskOptions::default())
                .unwrap();
        }
        lazy.load_parser(Language::Go);
        let rx = events.subscribe();

        lazy.respond_to_degradation(DegradationLevel::Normal, DegradationLevel::Elevated);

        let stats = lazy.get_cache_statistics();
        assert_eq!(stats.asts.size, 2);
        assert_eq!(stats.parsers.size, 1);
        assert_eq!(stats.current_depth, AnalysisDepth::Reduced);
        assert_eq!(stats.memory_pressure_responses, 1);
        assert!(rx
            .try_iter()
            .any(|e| e.name() == "memory-pressure:response"));

        // easing restores depth without another eviction
        lazy.respond_to_degradation(DegradationLevel::Elevated, DegradationLevel::Normal);
        let stats = lazy.get_cache_statistics();
        assert_eq!(stats.asts.size, 2);
        assert_eq!(stats.current_depth, AnalysisDepth::Full);
    }

    #[test]
    fn test_critical_level_disables_analysis() {
        let lazy = manager(&EventBus::new());
        lazy.respond_to_degradation(DegradationLevel::Normal, DegradationLevel::Critical);
        let err = lazy
            .load_ast(Path::new("a.py"), PY, &TaskOptions::default())
            .unwrap_err();
        assert!(matches!(err, TaskError::AnalysisDisabled(_)));
        assert_eq!(lazy.get_cache_statistics().asts.size, 0);
    }

    #[test]
    fn test_cleanup_and_unload() {
        let events = EventBus::new();
        let lazy = manager(&events);
        lazy.load_ast(Path::new("a.py"), PY, &TaskOptions::default())
            .unwrap();
        assert!(lazy.unload_parser(Language::Python));
        assert!(!lazy.unload_parser(Language::Python));

        let rx = events.subscribe();
        assert_eq!(lazy.schedule_cleanup(Duration::ZERO), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::CleanupCompleted { removed: 1 }
        ));
    }

    #[tokio::test]
    async fn test_follows_monitor_degradation() {
        let events = EventBus::new();
        let monitor = ResourceMonitor::with_sampler(
            MonitorConfig::default(),
            4,
            events.clone(),
            Arc::new(StaticSampler::default()),
        );
        let lazy = manager(&events);
        lazy.initialize(&monitor);

        monitor.set_degradation_level(DegradationLevel::Severe, "test");
        for _ in 0..50 {
            if lazy.current_depth() == AnalysisDepth::Minimal {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lazy.current_depth(), AnalysisDepth::Minimal);
        lazy.shutdown();
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(ContentHash::of(PY), ContentHash::of(PY));
        assert_ne!(ContentHash::of(PY), ContentHash::of("x = 1\n"));
        assert_eq!(
            ContentHash::of("").as_bytes(),
            blake3::hash(b"").as_bytes()
        );
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("./a/b/../c.py")), PathBuf::from("a/c.py"));
        assert_eq!(normalize_path(Path::new("../x.py")), PathBuf::from("../x.py"));
    }
}
