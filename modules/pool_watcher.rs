//! Pool watcher: keeps completing eligible files that show up in a directory
//!
//! Files are discovered on a timer tick and become eligible once their size
//! and modification time hold still across two ticks. Eligible files are
//! queued in name order and completed by the file scheduler with at most
//! `max_files` File Tasks at once. A stop signal ends discovery, drops the
//! queue and lets running File Tasks finish the jobs they already dispatched.
//!
//! In staged mode the watched directory is `<root>/in`. Each eligible file is
//! moved to `<root>/.cache` under a unique timestamped name, completed into
//! `<root>/out` and then removed from the cache. Files an earlier run left in
//! the cache are queued again at startup.

use chrono::Local;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::modules::config::{CompletionSettings, PoolSettings};
use crate::modules::error::{ChatpoolError, ChatpoolResult};
use crate::modules::file_scheduler::{AggregateStatus, FileCompletionScheduler, FileTaskResult};

/// Drop directory of a staged pool
pub const IN_DIR: &str = "in";
/// Result directory of a staged pool
pub const OUT_DIR: &str = "out";
/// Files being completed in a staged pool
pub const CACHE_DIR: &str = ".cache";

/// Results kept in [`PoolSummary::recent`]
pub const RECENT_RESULTS: usize = 64;

type FileTaskOutput = ChatpoolResult<FileTaskResult>;

/// Tracking state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Seen, waiting for its size and modification time to hold still
    Settling,
    /// Queued, not started yet
    Discovered,
    Running,
    Done,
}

/// Size and modification time observed by one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileSnapshot {
    async fn read(path: &Path) -> Option<Self> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// One tracked file
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub state: EntryState,
    /// Snapshot taken by the previous scan while settling
    pub seen: Option<FileSnapshot>,
    /// Modification time seen after the last run finished
    pub modified: Option<SystemTime>,
    pub last_status: Option<AggregateStatus>,
    pub error: Option<String>,
    pub runs: u32,
}

impl PoolEntry {
    fn settling(snapshot: FileSnapshot) -> Self {
        Self {
            state: EntryState::Settling,
            seen: Some(snapshot),
            ..Self::queued()
        }
    }

    fn queued() -> Self {
        Self {
            state: EntryState::Discovered,
            seen: None,
            modified: None,
            last_status: None,
            error: None,
            runs: 0,
        }
    }

    fn has_failed_units(&self) -> bool {
        matches!(
            self.last_status,
            Some(AggregateStatus::PartialFailure | AggregateStatus::AllFailed)
        )
    }
}

/// Decides which files the pool picks up
pub trait FileFilter: Send + Sync {
    fn accepts(&self, path: &Path) -> bool;

    /// Whether a done file is completed again. `modified` is its current
    /// modification time.
    fn allow_reprocess(&self, _path: &Path, _entry: &PoolEntry, _modified: Option<SystemTime>) -> bool {
        false
    }
}

/// Accepts files by extension, case-insensitively
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
    reprocess_on_change: bool,
}

impl ExtensionFilter {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            reprocess_on_change: false,
        }
    }

    pub fn reprocess_on_change(mut self, enabled: bool) -> Self {
        self.reprocess_on_change = enabled;
        self
    }
}

impl FileFilter for ExtensionFilter {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn allow_reprocess(&self, _path: &Path, entry: &PoolEntry, modified: Option<SystemTime>) -> bool {
        self.reprocess_on_change && modified.is_some() && modified != entry.modified
    }
}

/// Where completed documents go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    InPlace,
    Directory(PathBuf),
    /// Move each file into `cache`, write its result to `out`, then delete
    /// the cached copy
    Staged { cache: PathBuf, out: PathBuf },
}

impl OutputTarget {
    /// Staged layout under a pool root. `out` replaces `<root>/out` when given.
    pub fn staged(root: &Path, out: Option<PathBuf>) -> Self {
        OutputTarget::Staged {
            cache: root.join(CACHE_DIR),
            out: out.unwrap_or_else(|| root.join(OUT_DIR)),
        }
    }

    /// `None` means rewrite the source
    pub fn destination_for(&self, path: &Path) -> Option<PathBuf> {
        match self {
            OutputTarget::InPlace => None,
            OutputTarget::Directory(dir) | OutputTarget::Staged { out: dir, .. } => {
                path.file_name().map(|name| dir.join(name))
            }
        }
    }

    fn is_staged(&self) -> bool {
        matches!(self, OutputTarget::Staged { .. })
    }
}

/// What a watcher did before it stopped
#[derive(Debug, Default)]
pub struct PoolSummary {
    pub files_completed: usize,
    /// File Tasks that ended with an error (parse, configuration, IO, panic)
    pub files_failed: usize,
    /// Queued files never started because of the stop signal
    pub files_skipped: usize,
    /// Completed File Tasks per aggregate status
    pub by_status: HashMap<AggregateStatus, usize>,
    /// Latest results, oldest first, at most [`RECENT_RESULTS`]
    pub recent: VecDeque<FileTaskResult>,
}

impl PoolSummary {
    fn record(&mut self, result: FileTaskResult) {
        self.files_completed += 1;
        *self.by_status.entry(result.status).or_default() += 1;
        if self.recent.len() == RECENT_RESULTS {
            self.recent.pop_front();
        }
        self.recent.push_back(result);
    }
}

pub struct PoolWatcher {
    directory: PathBuf,
    scheduler: Arc<FileCompletionScheduler>,
    filter: Arc<dyn FileFilter>,
    settings: Arc<CompletionSettings>,
    output: OutputTarget,
    max_files: usize,
    poll_interval: Duration,
    status_interval: Duration,
    entries: HashMap<PathBuf, PoolEntry>,
    queue: VecDeque<PathBuf>,
    rejected: HashSet<PathBuf>,
    tasks: HashMap<TaskId, PathBuf>,
    summary: PoolSummary,
}

impl PoolWatcher {
    pub fn new(
        directory: impl Into<PathBuf>,
        scheduler: Arc<FileCompletionScheduler>,
        filter: Arc<dyn FileFilter>,
        settings: CompletionSettings,
    ) -> Self {
        let defaults = PoolSettings::default();
        Self {
            directory: directory.into(),
            scheduler,
            filter,
            settings: Arc::new(settings),
            output: OutputTarget::InPlace,
            max_files: defaults.file_limit(),
            poll_interval: defaults.poll_interval(),
            status_interval: defaults.status_interval(),
            entries: HashMap::new(),
            queue: VecDeque::new(),
            rejected: HashSet::new(),
            tasks: HashMap::new(),
            summary: PoolSummary::default(),
        }
    }

    /// Watcher configured from pool settings, with an extension filter. In
    /// staged mode `directory` is the pool root and `<root>/in` is watched.
    pub fn from_settings(
        directory: impl Into<PathBuf>,
        scheduler: Arc<FileCompletionScheduler>,
        settings: CompletionSettings,
        pool: &PoolSettings,
    ) -> ChatpoolResult<Self> {
        pool.validate()?;
        let filter = ExtensionFilter::new(pool.extensions.as_slice()).reprocess_on_change(pool.reprocess_on_change);
        let directory: PathBuf = directory.into();
        let (watched, output) = if pool.staged {
            (directory.join(IN_DIR), OutputTarget::staged(&directory, pool.out_dir.clone()))
        } else {
            let output = match &pool.out_dir {
                Some(dir) => OutputTarget::Directory(dir.clone()),
                None => OutputTarget::InPlace,
            };
            (directory, output)
        };

        Ok(Self::new(watched, scheduler, Arc::new(filter), settings)
            .with_output(output)
            .with_max_files(pool.file_limit())
            .with_poll_interval(pool.poll_interval())
            .with_status_interval(pool.status_interval()))
    }

    pub fn with_output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_status_interval(mut self, status_interval: Duration) -> Self {
        self.status_interval = status_interval;
        self
    }

    /// Watch until `stop` fires, then wait for the running File Tasks
    pub async fn run(mut self, stop: CancellationToken) -> ChatpoolResult<PoolSummary> {
        self.settings.validate()?;
        if self.max_files == 0 {
            return Err(ChatpoolError::config("max_files must be positive"));
        }
        if let OutputTarget::Staged { cache, out } = &self.output {
            for dir in [&self.directory, cache, out] {
                create_dir(dir).await?;
            }
        }
        match tokio::fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(ChatpoolError::config(format!(
                    "{} is not a directory",
                    self.directory.display()
                )))
            }
            Err(source) => {
                return Err(ChatpoolError::Read {
                    path: self.directory.clone(),
                    source,
                })
            }
        }
        match self.output.clone() {
            OutputTarget::Directory(dir) => create_dir(&dir).await?,
            OutputTarget::Staged { cache, .. } => self.reload_cache(&cache).await,
            OutputTarget::InPlace => {}
        }

        info!(
            "Watching {} (max {} files, polling every {:?})",
            self.directory.display(),
            self.max_files,
            self.poll_interval
        );

        let file_cancel = stop.child_token();
        let mut running: JoinSet<FileTaskOutput> = JoinSet::new();
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = interval_at(Instant::now() + self.status_interval, self.status_interval);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    self.finish(joined).await;
                    self.admit(&mut running, &file_cancel);
                }
                _ = poll.tick() => {
                    self.scan().await;
                    self.admit(&mut running, &file_cancel);
                }
                _ = status.tick() => info!("{}", self.status_line(running.len())),
            }
        }

        self.summary.files_skipped = self.queue.len();
        self.queue.clear();
        info!(
            "Stop requested: {} queued file(s) dropped, waiting for {} running",
            self.summary.files_skipped,
            running.len()
        );
        file_cancel.cancel();

        while let Some(joined) = running.join_next_with_id().await {
            self.finish(joined).await;
        }

        info!(
            "Pool stopped: {} completed, {} failed, {} skipped",
            self.summary.files_completed, self.summary.files_failed, self.summary.files_skipped
        );
        Ok(self.summary)
    }

    /// Queue the files an earlier run left in the cache
    async fn reload_cache(&mut self, cache: &Path) {
        let leftovers = match list_files(cache).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cannot list {}: {}", cache.display(), e);
                return;
            }
        };
        if !leftovers.is_empty() {
            warn!("Cache {} is not empty, reloading {} file(s)", cache.display(), leftovers.len());
        }
        for path in leftovers {
            if !self.filter.accepts(&path) {
                warn!("Leaving {} in the cache: not an eligible file", path.display());
                continue;
            }
            info!("Reloading {}", path.display());
            self.entries.insert(path.clone(), PoolEntry::queued());
            self.queue.push_back(path);
        }
    }

    /// List the directory and queue files that became eligible
    async fn scan(&mut self) {
        let found = match list_files(&self.directory).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cannot list {}: {}", self.directory.display(), e);
                return;
            }
        };
        self.prune(&found);

        for path in found {
            if !self.filter.accepts(&path) {
                if self.rejected.insert(path.clone()) {
                    warn!("Ignoring {}: not an eligible file", path.display());
                }
                continue;
            }
            let Some(snapshot) = FileSnapshot::read(&path).await else {
                continue;
            };

            let Some(entry) = self.entries.get_mut(&path) else {
                debug!("Discovered {}, waiting for it to settle", path.display());
                self.entries.insert(path, PoolEntry::settling(snapshot));
                continue;
            };
            let settled = match entry.state {
                EntryState::Settling if entry.seen == Some(snapshot) => true,
                EntryState::Settling => {
                    entry.seen = Some(snapshot);
                    false
                }
                EntryState::Done if self.filter.allow_reprocess(&path, entry, snapshot.modified) => {
                    info!("{} changed, completing it again once it settles", path.display());
                    entry.state = EntryState::Settling;
                    entry.seen = Some(snapshot);
                    false
                }
                _ => false,
            };
            if settled {
                self.enqueue(path).await;
            }
        }
    }

    /// Forget files that left the directory. Queued and running files stay tracked.
    fn prune(&mut self, found: &[PathBuf]) {
        let listed: HashSet<&PathBuf> = found.iter().collect();
        self.entries.retain(|path, entry| {
            listed.contains(path) || matches!(entry.state, EntryState::Discovered | EntryState::Running)
        });
        self.rejected.retain(|path| listed.contains(path));
    }

    /// Queue a settled file, staging it first when the pool is staged
    async fn enqueue(&mut self, path: PathBuf) {
        if let OutputTarget::Staged { cache, out } = &self.output {
            let (cache, out) = (cache.clone(), out.clone());
            self.entries.remove(&path);
            match stage_file(&path, &cache, &out).await {
                Ok(staged) => {
                    info!("Queueing {} as {}", path.display(), staged.display());
                    self.entries.insert(staged.clone(), PoolEntry::queued());
                    self.queue.push_back(staged);
                }
                Err(e) => warn!("Cannot move {} into {}: {}", path.display(), cache.display(), e),
            }
            return;
        }

        if let Some(entry) = self.entries.get_mut(&path) {
            entry.state = EntryState::Discovered;
            entry.seen = None;
        }
        info!("Queueing {}", path.display());
        self.queue.push_back(path);
    }

    /// Start queued files while below the file limit
    fn admit(&mut self, running: &mut JoinSet<FileTaskOutput>, cancel: &CancellationToken) {
        while running.len() < self.max_files {
            let Some(path) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&path) else {
                continue;
            };
            entry.state = EntryState::Running;
            entry.runs += 1;
            info!("Starting {} (run {})", path.display(), entry.runs);

            let destination = self.output.destination_for(&path);
            let scheduler = self.scheduler.clone();
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            let source = path.clone();

            let handle = running.spawn(async move {
                scheduler
                    .complete_file(&source, destination.as_deref(), &settings, &cancel)
                    .await
            });
            self.tasks.insert(handle.id(), path);
        }
    }

    async fn finish(&mut self, joined: Result<(TaskId, FileTaskOutput), JoinError>) {
        let (id, result) = match joined {
            Ok(output) => output,
            Err(e) => (e.id(), Err(ChatpoolError::Join(e))),
        };
        let Some(path) = self.tasks.remove(&id) else {
            warn!("Finished File Task {} was not tracked", id);
            return;
        };
        let staged = self.output.is_staged();

        let outcome = match result {
            Ok(result) => {
                if staged {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Cannot remove {} from the cache: {}", path.display(), e);
                    }
                }
                debug!("{} done: {}", path.display(), result.status);
                let status = result.status;
                self.summary.record(result);
                Ok(status)
            }
            Err(e) => {
                error!("Failed to complete {}: {}", path.display(), e);
                if staged {
                    warn!("{} stays in the cache until the next start", path.display());
                }
                self.summary.files_failed += 1;
                Err(e.to_string())
            }
        };

        if staged {
            self.entries.remove(&path);
            return;
        }
        let modified = modified_time(&path).await;
        let Some(entry) = self.entries.get_mut(&path) else {
            return;
        };
        entry.state = EntryState::Done;
        entry.modified = modified;
        match outcome {
            Ok(status) => {
                entry.last_status = Some(status);
                entry.error = None;
            }
            Err(message) => entry.error = Some(message),
        }
    }

    fn status_line(&self, running: usize) -> String {
        let done: Vec<&PoolEntry> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Done)
            .collect();
        let settling = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Settling)
            .count();
        let with_failures = done.iter().filter(|e| e.has_failed_units()).count();
        let with_errors = done.iter().filter(|e| e.error.is_some()).count();
        let reruns: u32 = self.entries.values().map(|e| e.runs.saturating_sub(1)).sum();

        format!(
            "Pool {}: {} settling, {} queued, {} running, {} done ({} with failed units, {} with errors), {} re-run(s)",
            self.directory.display(),
            settling,
            self.queue.len(),
            running,
            done.len(),
            with_failures,
            with_errors,
            reruns
        )
    }
}

async fn create_dir(dir: &Path) -> ChatpoolResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ChatpoolError::Write {
            path: dir.to_path_buf(),
            source,
        })
}

/// Regular files of `dir`, dot files excluded, sorted by name
async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut listing = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = listing.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Move `path` into `cache` under a timestamped name free in both `cache` and `out`
async fn stage_file(path: &Path, cache: &Path, out: &Path) -> std::io::Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamped = format!("{} {}", Local::now().format("%Y-%m-%d %H%M%S"), name);
    let target = cache.join(unique_name(&stamped, &[cache, out]).await);
    tokio::fs::rename(path, &target).await?;
    Ok(target)
}

/// `name`, or `<stem> [n].<ext>` with the smallest `n` unused in every directory
async fn unique_name(name: &str, dirs: &[&Path]) -> String {
    let file = Path::new(name);
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = name.to_string();
    let mut n = 0;
    loop {
        let mut taken = false;
        for dir in dirs {
            if tokio::fs::try_exists(dir.join(&candidate)).await.unwrap_or(false) {
                taken = true;
                break;
            }
        }
        if !taken {
            return candidate;
        }
        n += 1;
        candidate = format!("{} [{}]{}", stem, n, extension);
    }
}

/// Watch `directory` until `stop` fires, completing every file `filter` accepts
pub async fn watch_pool_files(
    directory: &Path,
    filter: Arc<dyn FileFilter>,
    poll_interval: Duration,
    scheduler: Arc<FileCompletionScheduler>,
    settings: CompletionSettings,
    stop: CancellationToken,
) -> ChatpoolResult<PoolSummary> {
    PoolWatcher::new(directory, scheduler, filter, settings)
        .with_poll_interval(poll_interval)
        .run(stop)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::conversation::ConversationParser;
    use crate::modules::task_runner::BackoffPolicy;
    use crate::modules::testing::{ScriptedClient, Step};

    const POLL: Duration = Duration::from_millis(20);

    fn settings(max_concurrent: usize) -> CompletionSettings {
        CompletionSettings {
            timeout_secs: 10,
            retries: 0,
            max_concurrent: Some(max_concurrent),
            ..Default::default()
        }
    }

    fn scheduler(client: &Arc<ScriptedClient>) -> Arc<FileCompletionScheduler> {
        Arc::new(FileCompletionScheduler::new(client.clone()).with_backoff(BackoffPolicy::fixed(Duration::from_millis(10))))
    }

    fn chat_filter() -> Arc<dyn FileFilter> {
        Arc::new(ExtensionFilter::new(&["chat"]))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    /// Non-dot entries of `dir`, sorted
    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|listing| {
                listing
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| !n.starts_with('.'))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn result_for(name: &str) -> FileTaskResult {
        let document = ConversationParser::new().parse("").unwrap();
        FileTaskResult::from_document(PathBuf::from(name), PathBuf::from(name), &document, 0, 0)
    }

    #[test]
    fn test_extension_filter() {
        let filter = ExtensionFilter::new(&[".chat", "TXT"]);
        assert!(filter.accepts(Path::new("/pool/a.chat")));
        assert!(filter.accepts(Path::new("/pool/b.txt")));
        assert!(filter.accepts(Path::new("/pool/C.CHAT")));
        assert!(!filter.accepts(Path::new("/pool/notes.md")));
        assert!(!filter.accepts(Path::new("/pool/chat")));

        let entry = PoolEntry {
            state: EntryState::Done,
            modified: Some(SystemTime::UNIX_EPOCH),
            ..PoolEntry::queued()
        };
        let later = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(5));
        assert!(!filter.allow_reprocess(Path::new("a.chat"), &entry, later));
        let filter = filter.reprocess_on_change(true);
        assert!(filter.allow_reprocess(Path::new("a.chat"), &entry, later));
        assert!(!filter.allow_reprocess(Path::new("a.chat"), &entry, entry.modified));
    }

    #[test]
    fn test_output_target() {
        assert_eq!(OutputTarget::InPlace.destination_for(Path::new("/pool/a.chat")), None);
        assert_eq!(
            OutputTarget::Directory(PathBuf::from("/out")).destination_for(Path::new("/pool/a.chat")),
            Some(PathBuf::from("/out/a.chat"))
        );

        let staged = OutputTarget::staged(Path::new("/pool"), None);
        assert_eq!(
            staged,
            OutputTarget::Staged {
                cache: PathBuf::from("/pool/.cache"),
                out: PathBuf::from("/pool/out"),
            }
        );
        assert_eq!(
            staged.destination_for(Path::new("/pool/.cache/2024-05-01 101500 a.chat")),
            Some(PathBuf::from("/pool/out/2024-05-01 101500 a.chat"))
        );
        assert_eq!(
            OutputTarget::staged(Path::new("/pool"), Some(PathBuf::from("/done"))).destination_for(Path::new("a.chat")),
            Some(PathBuf::from("/done/a.chat"))
        );
    }

    #[test]
    fn test_summary_keeps_a_bounded_window() {
        let mut summary = PoolSummary::default();
        for i in 0..RECENT_RESULTS + 3 {
            summary.record(result_for(&format!("{}.chat", i)));
        }

        assert_eq!(summary.files_completed, RECENT_RESULTS + 3);
        assert_eq!(summary.by_status.get(&AggregateStatus::AllSucceeded), Some(&(RECENT_RESULTS + 3)));
        assert_eq!(summary.recent.len(), RECENT_RESULTS);
        assert_eq!(summary.recent[0].source, PathBuf::from("3.chat"));
    }

    #[tokio::test]
    async fn test_unique_name_skips_taken_names() {
        let cache = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dirs = [cache.path(), out.path()];

        assert_eq!(unique_name("a.chat", &dirs).await, "a.chat");
        std::fs::write(cache.path().join("a.chat"), "").unwrap();
        assert_eq!(unique_name("a.chat", &dirs).await, "a [1].chat");
        std::fs::write(out.path().join("a [1].chat"), "").unwrap();
        assert_eq!(unique_name("a.chat", &dirs).await, "a [2].chat");
    }

    #[tokio::test]
    async fn test_growing_file_waits_until_settled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copying.chat");
        std::fs::write(&path, ":user first\n").unwrap();

        let client = Arc::new(ScriptedClient::new());
        let mut watcher = PoolWatcher::new(dir.path(), scheduler(&client), chat_filter(), settings(1));

        watcher.scan().await;
        assert!(watcher.queue.is_empty());
        assert_eq!(watcher.entries[&path].state, EntryState::Settling);

        // Still being copied between two scans
        let mut content = read(&path);
        content.push_str("===\n:user second\n");
        std::fs::write(&path, content).unwrap();
        watcher.scan().await;
        assert!(watcher.queue.is_empty());
        assert_eq!(watcher.entries[&path].state, EntryState::Settling);

        watcher.scan().await;
        assert_eq!(watcher.queue, VecDeque::from([path.clone()]));
        assert_eq!(watcher.entries[&path].state, EntryState::Discovered);
    }

    #[tokio::test]
    async fn test_removed_files_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("done.chat");
        let notes = dir.path().join("notes.md");
        std::fs::write(&done, ":user q\n").unwrap();
        std::fs::write(&notes, "text\n").unwrap();

        let client = Arc::new(ScriptedClient::new());
        let mut watcher = PoolWatcher::new(dir.path(), scheduler(&client), chat_filter(), settings(1));
        watcher.scan().await;
        watcher.scan().await;
        watcher.queue.clear();
        if let Some(entry) = watcher.entries.get_mut(&done) {
            entry.state = EntryState::Done;
        }
        assert!(watcher.rejected.contains(&notes));

        std::fs::remove_file(&done).unwrap();
        std::fs::remove_file(&notes).unwrap();
        watcher.scan().await;
        assert!(watcher.entries.is_empty());
        assert!(watcher.rejected.is_empty());

        // The same name dropped again is a new file
        std::fs::write(&done, ":user again\n").unwrap();
        watcher.scan().await;
        watcher.scan().await;
        assert_eq!(watcher.queue, VecDeque::from([done]));
    }

    #[tokio::test]
    async fn test_panicking_file_task_is_marked_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boom.chat");
        std::fs::write(&path, ":user boom\n").unwrap();

        let client = Arc::new(ScriptedClient::new().script("boom", vec![Step::panic()]));
        let mut watcher = PoolWatcher::new(dir.path(), scheduler(&client), chat_filter(), settings(1));
        watcher.scan().await;
        watcher.scan().await;

        let cancel = CancellationToken::new();
        let mut running = JoinSet::new();
        watcher.admit(&mut running, &cancel);
        assert_eq!(watcher.entries[&path].state, EntryState::Running);
        assert_eq!(watcher.tasks.len(), 1);

        let joined = running.join_next_with_id().await.unwrap();
        assert!(joined.as_ref().is_err_and(|e| e.is_panic()));
        watcher.finish(joined).await;

        let entry = &watcher.entries[&path];
        assert_eq!(entry.state, EntryState::Done);
        assert_eq!(entry.runs, 1);
        assert!(entry.error.as_deref().unwrap_or_default().contains("background task failed"));
        assert!(watcher.tasks.is_empty());
        assert_eq!(watcher.summary.files_failed, 1);
        assert!(watcher
            .status_line(0)
            .contains("0 running, 1 done (0 with failed units, 1 with errors), 0 re-run(s)"));
        assert_eq!(read(&path), ":user boom\n");
    }

    #[tokio::test]
    async fn test_completes_eligible_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.chat"), ":user qa\n").unwrap();
        std::fs::write(dir.path().join("b.chat"), ":user qb\n").unwrap();
        std::fs::write(dir.path().join(".hidden.chat"), ":user hidden\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), ":user notes\n").unwrap();
        std::fs::write(dir.path().join("broken.chat"), "no directive here\n").unwrap();

        let client = Arc::new(ScriptedClient::new());
        let stop = CancellationToken::new();
        let watcher = PoolWatcher::new(dir.path(), scheduler(&client), chat_filter(), settings(2))
            .with_poll_interval(POLL)
            .with_max_files(2);
        let handle = tokio::spawn(watcher.run(stop.clone()));

        let a = dir.path().join("a.chat");
        let b = dir.path().join("b.chat");
        wait_until(|| read(&a).contains(":assistant") && read(&b).contains(":assistant")).await;
        // Give the broken file a chance to be picked up too
        tokio::time::sleep(POLL * 5).await;
        stop.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.files_completed, 2);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(read(&a), ":user qa\n:assistant\nreply to qa\n");
        assert_eq!(read(dir.path().join(".hidden.chat").as_path()), ":user hidden\n");
        assert_eq!(read(dir.path().join("notes.md").as_path()), ":user notes\n");
        assert_eq!(read(dir.path().join("broken.chat").as_path()), "no directive here\n");

        let mut calls = client.calls();
        calls.sort();
        assert_eq!(calls, vec!["qa", "qb"]);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_job_finish() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.chat");
        let queued = dir.path().join("second.chat");
        std::fs::write(&first, ":user slow\n===\n:user never\n").unwrap();
        std::fs::write(&queued, ":user queued\n").unwrap();

        let client = Arc::new(
            ScriptedClient::new().script("slow", vec![Step::reply("finished").after(Duration::from_millis(300))]),
        );
        let stop = CancellationToken::new();
        let watcher = PoolWatcher::new(dir.path(), scheduler(&client), chat_filter(), settings(1))
            .with_poll_interval(POLL)
            .with_max_files(1);
        let handle = tokio::spawn(watcher.run(stop.clone()));

        wait_until(|| client.in_flight() == 1).await;
        stop.cancel();
        let late = dir.path().join("late.chat");
        std::fs::write(&late, ":user late\n").unwrap();

        let summary = handle.await.unwrap().unwrap();

        // The dispatched job ran to completion before the watcher returned
        assert_eq!(client.calls(), vec!["slow"]);
        assert_eq!(client.in_flight(), 0);
        assert_eq!(read(&first), ":user slow\n:assistant\nfinished\n===\n:user never\n");
        assert_eq!(summary.recent.len(), 1);
        assert_eq!(summary.recent[0].status, AggregateStatus::Interrupted);
        assert_eq!(summary.by_status.get(&AggregateStatus::Interrupted), Some(&1));

        // Nothing queued or discovered later was started
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(read(&queued), ":user queued\n");
        assert_eq!(read(&late), ":user late\n");
    }

    #[tokio::test]
    async fn test_done_files_are_not_reprocessed_unless_allowed() {
        for reprocess in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("grow.chat");
            std::fs::write(&path, ":user one\n").unwrap();

            let client = Arc::new(ScriptedClient::new());
            let stop = CancellationToken::new();
            let filter = Arc::new(ExtensionFilter::new(&["chat"]).reprocess_on_change(reprocess));
            let watcher = PoolWatcher::new(dir.path(), scheduler(&client), filter, settings(2)).with_poll_interval(POLL);
            let handle = tokio::spawn(watcher.run(stop.clone()));

            wait_until(|| read(&path).contains("reply to one")).await;
            tokio::time::sleep(POLL * 3).await;

            let mut content = read(&path);
            content.push_str("===\n:user two\n");
            std::fs::write(&path, content).unwrap();

            if reprocess {
                wait_until(|| read(&path).contains("reply to two")).await;
            } else {
                tokio::time::sleep(POLL * 10).await;
            }
            stop.cancel();
            handle.await.unwrap().unwrap();

            let expected = if reprocess { vec!["one", "two"] } else { vec!["one"] };
            assert_eq!(client.calls(), expected);
        }
    }

    #[tokio::test]
    async fn test_output_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.chat");
        std::fs::write(&source, ":user qa\n").unwrap();

        let client = Arc::new(ScriptedClient::new());
        let pool = PoolSettings {
            extensions: vec!["chat".into()],
            out_dir: Some(out.path().join("done")),
            ..Default::default()
        };
        let stop = CancellationToken::new();
        let watcher = PoolWatcher::from_settings(dir.path(), scheduler(&client), settings(1), &pool)
            .unwrap()
            .with_poll_interval(POLL);
        let handle = tokio::spawn(watcher.run(stop.clone()));

        let target = out.path().join("done").join("a.chat");
        wait_until(|| target.exists()).await;
        stop.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.files_completed, 1);
        assert_eq!(read(&source), ":user qa\n");
        assert_eq!(read(&target), ":user qa\n:assistant\nreply to qa\n");
    }

    #[tokio::test]
    async fn test_staged_pool_moves_completes_and_reloads() {
        let root = tempfile::tempdir().unwrap();
        let in_dir = root.path().join(IN_DIR);
        let out_dir = root.path().join(OUT_DIR);
        let cache = root.path().join(CACHE_DIR);
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        // Left over by an earlier run
        std::fs::write(cache.join("2024-05-01 101500 old.chat"), ":user old\n").unwrap();
        std::fs::write(in_dir.join("new.chat"), ":user new\n").unwrap();

        let client = Arc::new(ScriptedClient::new());
        let pool = PoolSettings {
            extensions: vec!["chat".into()],
            staged: true,
            ..Default::default()
        };
        let stop = CancellationToken::new();
        let watcher = PoolWatcher::from_settings(root.path(), scheduler(&client), settings(1), &pool)
            .unwrap()
            .with_poll_interval(POLL);
        let handle = tokio::spawn(watcher.run(stop.clone()));

        wait_until(|| names_in(&out_dir).len() == 2).await;

        // A later file reusing a processed name gets its own output
        std::fs::write(in_dir.join("new.chat"), ":user new\n").unwrap();
        wait_until(|| names_in(&out_dir).len() == 3).await;
        stop.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.files_completed, 3);
        assert!(names_in(&in_dir).is_empty());
        assert!(names_in(&cache).is_empty());

        let outputs = names_in(&out_dir);
        assert!(outputs.contains(&"2024-05-01 101500 old.chat".to_string()));
        assert_eq!(
            read(&out_dir.join("2024-05-01 101500 old.chat")),
            ":user old\n:assistant\nreply to old\n"
        );
        let fresh: Vec<&String> = outputs.iter().filter(|n| n.contains(" new")).collect();
        assert_eq!(fresh.len(), 2);
        for name in fresh {
            assert_eq!(read(&out_dir.join(name)), ":user new\n:assistant\nreply to new\n");
        }

        let mut calls = client.calls();
        calls.sort();
        assert_eq!(calls, vec!["new", "new", "old"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let client = Arc::new(ScriptedClient::new());
        let result = watch_pool_files(
            Path::new("/nonexistent/chatpool-pool"),
            chat_filter(),
            POLL,
            scheduler(&client),
            settings(1),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ChatpoolError::Read { .. })));
    }
}
