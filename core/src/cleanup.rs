//! Cleanup guard for the temporary files of one task.
//!
//! Every path a task writes to is allocated from its [`TempArtifactSet`], under
//! one uniquely named directory. A path either gets promoted into the target
//! directory or is deleted when the set is released. Release happens exactly
//! once: explicitly by the worker, by the engine on shutdown, or on drop.
//! If writers still hold files open, deletion is deferred until the last
//! [`ArtifactWriter`] closes.
//!
//! A live set holds an exclusive lock on `<dir>.lock` next to its directory,
//! so [`sweep_stale`] can tell a crashed run's leftovers from a download
//! another process is still writing.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::task::TaskId;

pub const TEMP_DIR_PREFIX: &str = ".mediagrab-";
const MAX_NAME_CHARS: usize = 100;
const MAX_COLLISION_SUFFIX: u32 = 10_000;
const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Default)]
struct ArtifactState {
    dir_created: bool,
    lock: Option<File>,
    paths: Vec<PathBuf>,
    writers: HashMap<PathBuf, usize>,
    released: bool,
    deleted: bool,
}

impl ArtifactState {
    fn open_writers(&self) -> usize {
        self.writers.values().sum()
    }
}

#[derive(Debug)]
pub struct TempArtifactSet {
    task_id: TaskId,
    dir: PathBuf,
    state: Mutex<ArtifactState>,
}

impl TempArtifactSet {
    /// Nothing touches the filesystem until the first path is allocated.
    pub fn new(task_id: TaskId, parent: &Path) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            dir: parent.join(format!("{}{}", TEMP_DIR_PREFIX, task_id)),
            state: Mutex::new(ArtifactState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().map(|state| state.released).unwrap_or(true)
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .map(|state| state.paths.clone())
            .unwrap_or_default()
    }

    /// Reserves `name` inside the task directory, creating the directory on first use.
    pub fn allocate(&self, name: &str) -> CoreResult<PathBuf> {
        let mut state = self.lock()?;
        if state.released {
            return Err(CoreError::InvalidState(format!(
                "temp artifacts of task {} already released",
                self.task_id
            )));
        }
        if !state.dir_created {
            let lock = acquire_dir_lock(&self.dir)?;
            if let Err(err) = fs::create_dir_all(&self.dir) {
                drop(lock);
                let _ = fs::remove_file(lock_path(&self.dir));
                return Err(err.into());
            }
            state.lock = Some(lock);
            state.dir_created = true;
        }
        let path = self.dir.join(name);
        if !state.paths.contains(&path) {
            state.paths.push(path.clone());
        }
        Ok(path)
    }

    /// Opens an allocated path for writing. The returned writer keeps deletion
    /// of the set on hold until it is dropped.
    pub fn create_writer(self: &Arc<Self>, path: &Path, append: bool) -> CoreResult<ArtifactWriter> {
        let mut state = self.lock()?;
        if state.released {
            return Err(CoreError::InvalidState(format!(
                "temp artifacts of task {} already released",
                self.task_id
            )));
        }
        if !state.paths.iter().any(|tracked| tracked == path) {
            return Err(CoreError::InvalidState(format!(
                "{} is not a tracked artifact",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        *state.writers.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(ArtifactWriter {
            file: Some(file),
            path: path.to_path_buf(),
            owner: Arc::clone(self),
        })
    }

    /// Moves a tracked file into `dest_dir` under a collision-free name and
    /// stops tracking it.
    pub fn promote(&self, path: &Path, dest_dir: &Path, stem: &str, ext: &str) -> CoreResult<PathBuf> {
        let mut state = self.lock()?;
        if state.released {
            return Err(CoreError::InvalidState(format!(
                "temp artifacts of task {} already released",
                self.task_id
            )));
        }
        let Some(position) = state.paths.iter().position(|tracked| tracked == path) else {
            return Err(CoreError::InvalidState(format!(
                "{} is not a tracked artifact",
                path.display()
            )));
        };
        if state.writers.get(path).copied().unwrap_or(0) > 0 {
            return Err(CoreError::InvalidState(format!(
                "{} is still being written",
                path.display()
            )));
        }
        let dest = reserve_destination(dest_dir, stem, ext)?;
        if let Err(err) = move_file(path, &dest) {
            let _ = fs::remove_file(&dest);
            return Err(err.into());
        }
        state.paths.remove(position);
        debug!(task = %self.task_id, from = %path.display(), to = %dest.display(), "promoted artifact");
        Ok(dest)
    }

    /// Deletes everything still tracked. Safe to call any number of times.
    pub fn release(&self) {
        let Ok(mut state) = self.state.lock() else {
            // A poisoned lock still leaves the directory on disk; remove it anyway.
            let _ = fs::remove_dir_all(&self.dir);
            let _ = fs::remove_file(lock_path(&self.dir));
            return;
        };
        if state.released {
            return;
        }
        state.released = true;
        if state.open_writers() > 0 {
            debug!(task = %self.task_id, "deferring temp cleanup until writers close");
            return;
        }
        self.delete_locked(&mut state);
    }

    fn writer_closed(&self, path: &Path) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(count) = state.writers.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.writers.remove(path);
            }
        }
        if state.released && state.open_writers() == 0 {
            self.delete_locked(&mut state);
        }
    }

    fn delete_locked(&self, state: &mut ArtifactState) {
        if state.deleted {
            return;
        }
        state.deleted = true;
        state.paths.clear();
        if !state.dir_created {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(task = %self.task_id, dir = %self.dir.display(), "removed temp dir"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(task = %self.task_id, dir = %self.dir.display(), error = %err, "failed to remove temp dir")
            }
        }
        // The lock file goes before the handle so a sweeper never sees it unlocked.
        let _ = fs::remove_file(lock_path(&self.dir));
        state.lock = None;
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, ArtifactState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Poisoned("temp artifact"))
    }
}

impl Drop for TempArtifactSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Open handle on a tracked artifact. Closing it may complete a deferred cleanup.
pub struct ArtifactWriter {
    file: Option<File>,
    path: PathBuf,
    owner: Arc<TempArtifactSet>,
}

impl ArtifactWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        // Close the handle before the owner may unlink the file.
        drop(self.file.take());
        self.owner.writer_closed(&self.path);
    }
}

fn lock_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

fn acquire_dir_lock(dir: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path(dir))?;
    file.try_lock_exclusive()?;
    Ok(file)
}

/// Removes temp directories left behind by a process that died mid-download.
/// Directories whose lock is still held belong to a running download and are
/// left alone.
pub fn sweep_stale(dir: &Path) -> CoreResult<usize> {
    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(TEMP_DIR_PREFIX) || !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let lock = match OpenOptions::new().write(true).open(lock_path(&path)) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(dir = %path.display(), error = %err, "cannot open temp dir lock");
                continue;
            }
        };
        if let Some(file) = &lock {
            if let Err(err) = file.try_lock_exclusive() {
                if err.kind() == fs2::lock_contended_error().kind() {
                    debug!(dir = %path.display(), "temp dir in use; skipping");
                } else {
                    warn!(dir = %path.display(), error = %err, "cannot lock temp dir");
                }
                continue;
            }
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(dir = %path.display(), error = %err, "failed to sweep stale temp dir");
                continue;
            }
        }
        if lock.is_some() {
            let _ = fs::remove_file(lock_path(&path));
        }
    }
    Ok(removed)
}

/// Creates an empty placeholder at the first free `stem.ext`, `stem (1).ext`, ...
/// so two tasks never pick the same name.
pub fn reserve_destination(dir: &Path, stem: &str, ext: &str) -> io::Result<PathBuf> {
    for index in 0..MAX_COLLISION_SUFFIX {
        let name = if index == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{} ({}).{}", stem, index, ext)
        };
        let candidate = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {} in {}", stem, dir.display()),
    ))
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystems: copy, then drop the source.
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in name.chars() {
        let allowed = ch.is_alphanumeric()
            || matches!(ch, '.' | '_' | '-' | ' ' | '(' | ')' | '[' | ']' | '\'' | '!' | ',');
        let mapped = if allowed && !ch.is_control() { ch } else { '_' };
        if mapped == '_' || mapped == ' ' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(mapped);
    }
    let truncated: String = out.chars().take(MAX_NAME_CHARS).collect();
    let trimmed = truncated.trim_matches(&[' ', '.', '_'][..]).trim();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}
