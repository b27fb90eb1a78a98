//! Change watcher: `notify` events on entity files, debounced per path and
//! filtered to real mtime advances, delivered as [`ChangeRecord`]s.
//!
//! Delivery is best-effort. Missed events are caught by the orchestrator's
//! pull verification on read and by the periodic sweep.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

use ledger_core::{EntityRef, EntityType, FileKind, Workspace};

use crate::error::{io_err, DaemonError};

/// One observed change to an entity file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub kind: FileKind,
    pub entity: EntityRef,
    pub detected_at: DateTime<Utc>,
    pub observed_mtime: DateTime<Utc>,
}

/// Trailing-edge debounce per path plus an mtime high-water mark.
///
/// Every event pushes the path's deadline out by `window`; a path is due once
/// it has been quiet for a full window. A due path only becomes a change when
/// its mtime moved past the last one emitted for it.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
    last_mtime: HashMap<PathBuf, SystemTime>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            last_mtime: HashMap::new(),
        }
    }

    pub fn touch(&mut self, path: &Path, now: Instant) {
        self.pending.insert(path.to_path_buf(), now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return the paths whose quiet window has elapsed.
    pub fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due.sort();
        due
    }

    /// Record `mtime` for `path`; `false` when it did not advance.
    pub fn mtime_advanced(&mut self, path: &Path, mtime: SystemTime) -> bool {
        match self.last_mtime.get(path) {
            Some(previous) if mtime <= *previous => false,
            _ => {
                self.last_mtime.insert(path.to_path_buf(), mtime);
                true
            }
        }
    }
}

/// Watch the workspace's entity trees until `shutdown` fires.
pub async fn run(
    workspace: Workspace,
    window: Duration,
    changes: mpsc::Sender<ChangeRecord>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let workspace = match fs::canonicalize(workspace.root()) {
        Ok(root) => Workspace::new(root),
        Err(_) => workspace,
    };
    let roots = entity_roots(&workspace)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched_dirs = HashSet::new();
    for root in &roots {
        register_tree(&mut watcher, &mut watched_dirs, root)?;
    }

    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if path.is_dir() && roots.iter().any(|root| path.starts_with(root)) {
                        register_tree(&mut watcher, &mut watched_dirs, &path)?;
                        continue;
                    }
                    if workspace.resolve_path(&path).is_some() {
                        debouncer.touch(&path, Instant::now());
                    }
                }
            }
            _ = wait_until(deadline) => {
                for path in debouncer.due(Instant::now()) {
                    let Some(record) = change_record(&workspace, &path, &mut debouncer) else {
                        continue;
                    };
                    tracing::debug!(
                        entity = %record.entity.id,
                        kind = %record.kind,
                        path = %record.path.display(),
                        "change detected",
                    );
                    if changes.send(record).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    Ok(())
}

/// `Accounts/` and `Projects/`, created when missing and canonicalized so
/// event paths (which arrive as real paths) match.
fn entity_roots(workspace: &Workspace) -> Result<Vec<PathBuf>, DaemonError> {
    let mut roots = Vec::new();
    for entity_type in EntityType::all() {
        let dir = workspace.type_dir(*entity_type);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        roots.push(fs::canonicalize(&dir).unwrap_or(dir));
    }
    Ok(roots)
}

fn change_record(workspace: &Workspace, path: &Path, debouncer: &mut Debouncer) -> Option<ChangeRecord> {
    let (entity, kind) = workspace.resolve_path(path)?;
    let mtime = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "cannot stat changed file");
            }
            return None;
        }
    };
    if !debouncer.mtime_advanced(path, mtime) {
        return None;
    }
    Some(ChangeRecord {
        path: path.to_path_buf(),
        kind,
        entity,
        detected_at: Utc::now(),
        observed_mtime: DateTime::<Utc>::from(mtime),
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn register_tree(
    watcher: &mut RecommendedWatcher,
    watched_dirs: &mut HashSet<PathBuf>,
    root: &Path,
) -> Result<(), DaemonError> {
    for dir in collect_dirs(root)? {
        let canonical = match fs::canonicalize(&dir) {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&dir, err)),
        };
        if watched_dirs.insert(canonical.clone()) {
            watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
            tracing::debug!(path = %canonical.display(), "watching entity directory");
        }
    }
    Ok(())
}

/// `root` and every directory below it, at most one level of entity
/// directories deep in practice.
fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn rapid_saves_collapse_to_one_due_path() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let path = PathBuf::from("/ws/Accounts/Acme/dashboard.json");

        for _ in 0..5 {
            debouncer.touch(&path, Instant::now());
            assert!(debouncer.due(Instant::now()).is_empty());
            advance(Duration::from_millis(10)).await;
        }

        advance(Duration::from_millis(60)).await;
        assert!(
            debouncer.due(Instant::now()).is_empty(),
            "window restarts on every save"
        );
        advance(Duration::from_millis(50)).await;
        assert_eq!(debouncer.due(Instant::now()), vec![path]);
        assert!(debouncer.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn paths_debounce_independently() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let json = PathBuf::from("/ws/Accounts/Acme/dashboard.json");
        let md = PathBuf::from("/ws/Accounts/Acme/dashboard.md");

        debouncer.touch(&json, Instant::now());
        advance(Duration::from_millis(50)).await;
        debouncer.touch(&md, Instant::now());
        advance(Duration::from_millis(60)).await;

        assert_eq!(debouncer.due(Instant::now()), vec![json]);
        advance(Duration::from_millis(50)).await;
        assert_eq!(debouncer.due(Instant::now()), vec![md]);
    }

    #[test]
    fn only_advancing_mtimes_pass() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let path = Path::new("/ws/Projects/Rollout/dashboard.md");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        assert!(debouncer.mtime_advanced(path, t0));
        assert!(!debouncer.mtime_advanced(path, t0));
        assert!(!debouncer.mtime_advanced(path, t0 - Duration::from_secs(1)));
        assert!(debouncer.mtime_advanced(path, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn change_record_classifies_entity_files() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let ws = Workspace::new(tmp.path());
        let acme = ws
            .create_entity(EntityType::Account, "Acme Corp")
            .expect("create");
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        let record = change_record(&ws, &acme.canonical_path(), &mut debouncer).expect("record");
        assert_eq!(record.kind, FileKind::Canonical);
        assert_eq!(record.entity.id.as_str(), "acme-corp");
        assert!(
            change_record(&ws, &acme.canonical_path(), &mut debouncer).is_none(),
            "same mtime twice is not a change"
        );
        assert!(change_record(&ws, &acme.artifact_path(), &mut debouncer).is_none());
        assert!(change_record(&ws, &tmp.path().join("notes.txt"), &mut debouncer).is_none());
    }
}
