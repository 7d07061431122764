use crate::error::WatchError;
use crate::tailer::{FileWorker, TailerConfig};
use crate::ExtensionData;
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches one directory for files whose names match a pattern and keeps a tailer running
/// for each of them.
///
/// The watch path is absolute; its last segment is a regex matched against whole file
/// names. Named groups in the regex become extension fields of every record read from the
/// matching file, so `/var/log/app-(?P<host>\w+)\.log` tags lines of `app-web01.log` with
/// `host = web01`.
pub struct DirectoryWatcher {
    dir: PathBuf,
    pattern: Regex,
    config: TailerConfig,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryWatcher {
    pub fn new(path: impl AsRef<Path>, config: TailerConfig) -> Result<Self, WatchError> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(WatchError::NotAbsolute(path.display().to_string()));
        }

        let (Some(dir), Some(raw_pattern)) = (
            path.parent(),
            path.file_name().and_then(|name| name.to_str()),
        ) else {
            return Err(WatchError::MissingPattern(path.display().to_string()));
        };

        let pattern = compile_pattern(raw_pattern)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            pattern,
            config,
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// The anchored file name regex.
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Spawn the watch loop. Calling `start` on a running watcher does nothing.
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            error!(dir = %self.dir.display(), "watcher state poisoned; not starting");
            return;
        };
        if task.is_some() || self.cancel_token.is_cancelled() {
            return;
        }

        info!(
            dir = %self.dir.display(),
            pattern = %self.pattern.as_str(),
            "starting directory watcher"
        );
        *task = Some(tokio::spawn(run_watch_loop(
            self.dir.clone(),
            self.pattern.clone(),
            self.config.clone(),
            self.cancel_token.clone(),
        )));
    }

    /// Stop the watch loop and every tailer it owns.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, dir = %self.dir.display(), "watch loop panicked");
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn compile_pattern(raw: &str) -> Result<Regex, WatchError> {
    Regex::new(&format!("^(?:{raw})$")).map_err(|source| WatchError::InvalidPattern {
        pattern: raw.to_string(),
        source,
    })
}

/// Extension fields for `file_name`, or `None` when the name does not match.
fn extension_data(pattern: &Regex, file_name: &str) -> Option<ExtensionData> {
    let captures = pattern.captures(file_name)?;
    Some(
        pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect(),
    )
}

/// What a filesystem event means for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileChange {
    Written(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
    /// Renamed without saying which side; resolved by checking whether the path exists.
    Moved(PathBuf),
}

fn classify_event(event: Event) -> Vec<FileChange> {
    let Event { kind, paths, .. } = event;
    let each = |change: fn(PathBuf) -> FileChange, paths: Vec<PathBuf>| -> Vec<FileChange> {
        paths.into_iter().map(change).collect()
    };

    match kind {
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            each(FileChange::Written, paths)
        }
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            each(FileChange::Created, paths)
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            each(FileChange::Removed, paths)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            let mut paths = paths.into_iter();
            if let Some(from) = paths.next() {
                changes.push(FileChange::Removed(from));
            }
            if let Some(to) = paths.next() {
                changes.push(FileChange::Created(to));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => each(FileChange::Moved, paths),
        _ => Vec::new(),
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Worker table of one watch loop; only the loop task touches it.
struct WatchedFiles {
    dir: PathBuf,
    pattern: Regex,
    config: TailerConfig,
    watcher: RecommendedWatcher,
    workers: HashMap<String, FileWorker>,
}

impl WatchedFiles {
    async fn scan(&mut self) -> Result<(), WatchError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            if is_file {
                self.track(entry.path()).await;
            }
        }
        Ok(())
    }

    async fn apply(&mut self, change: FileChange) {
        match change {
            FileChange::Written(path) => {
                if let Some(worker) = file_name(&path).and_then(|name| self.workers.get(name)) {
                    worker.handle();
                }
            }
            FileChange::Created(path) => self.track(path).await,
            FileChange::Removed(path) => self.untrack(&path).await,
            FileChange::Moved(path) => {
                if tokio::fs::metadata(&path).await.is_ok() {
                    self.track(path).await;
                } else {
                    self.untrack(&path).await;
                }
            }
        }
    }

    async fn track(&mut self, path: PathBuf) {
        let Some(name) = file_name(&path).map(str::to_string) else {
            return;
        };
        if self.workers.contains_key(&name) {
            return;
        }
        let Some(extension) = extension_data(&self.pattern, &name) else {
            return;
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return,
        }

        if let Err(err) = self.watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!(error = %err, path = %path.display(), "failed to watch file");
        }

        let worker = FileWorker::start(path, extension, self.config.clone()).await;
        // Catch up on anything written since the stored offset.
        worker.handle();
        self.workers.insert(name, worker);
    }

    /// Stop the worker of a file that was removed or renamed away.
    ///
    /// Its stored offset is reset: a file recreated under the name is a new file.
    async fn untrack(&mut self, path: &Path) {
        let Some(name) = file_name(path) else {
            return;
        };
        let Some(worker) = self.workers.remove(name) else {
            return;
        };

        if let Err(err) = self.watcher.unwatch(path) {
            debug!(error = %err, path = %path.display(), "file already unwatched");
        }
        worker.forget().await;
    }

    fn shutdown(&mut self) {
        for worker in self.workers.values() {
            worker.stop();
        }
        self.workers.clear();
    }
}

async fn run_watch_loop(
    dir: PathBuf,
    pattern: Regex,
    config: TailerConfig,
    cancel_token: CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        },
        NotifyConfig::default(),
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            error!(error = %err, dir = %dir.display(), "failed to start watcher");
            return;
        }
    };

    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!(error = %err, dir = %dir.display(), "failed to watch directory");
        return;
    }

    let mut files = WatchedFiles {
        dir,
        pattern,
        config,
        watcher,
        workers: HashMap::new(),
    };

    if let Err(err) = files.scan().await {
        error!(error = %err, dir = %files.dir.display(), "failed to read directory");
        return;
    }
    info!(
        dir = %files.dir.display(),
        files = files.workers.len(),
        "directory watcher ready"
    );

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            received = event_rx.recv() => match received {
                Some(Ok(event)) => {
                    for change in classify_event(event) {
                        files.apply(change).await;
                    }
                }
                Some(Err(err)) => error!(error = %err, dir = %files.dir.display(), "file watcher error"),
                None => break,
            },
        }
    }

    files.shutdown();
    info!(dir = %files.dir.display(), "directory watcher stopped");
}
