//! Persistent per-container read positions.
//!
//! The whole map lives in a single JSON file. Every commit writes a fresh
//! temp file next to it, syncs it, and renames it over the previous one, so
//! a crash leaves either the old or the new content on disk.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{Deserialize, Serialize};

const STATE_VERSION: u32 = 1;

/// How far a container's output has been read, counted in stream order.
///
/// Reattaching with `since = since_seconds` makes the runtime replay every
/// frame stamped at or after that second, in the order it logged them. The
/// first `frames` of those were already emitted. Timestamps are only used to
/// pick the boundary, never to decide whether a frame was read, so frames of
/// two streams stamped out of order are neither lost nor duplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub since_seconds: i64,
    pub frames: u64,
}

impl Position {
    /// Nothing has been read yet.
    pub const BEGINNING: Position = Position {
        since_seconds: 0,
        frames: 0,
    };

    pub fn is_beginning(&self) -> bool {
        *self == Self::BEGINNING
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::BEGINNING
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported checkpoint file version {0}")]
    Version(u32),
    #[error("Blocking write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckpointFile {
    version: u32,
    containers: HashMap<String, Position>,
}

#[derive(Debug, Default)]
struct State {
    positions: HashMap<String, Position>,
    /// Bumped on every update, used to skip redundant file writes.
    generation: u64,
}

/// Checkpoint store shared by every tail task.
///
/// The in-memory map is guarded by a short-lived mutex. File writes are
/// serialised separately and coalesced: a caller whose update was already
/// included in a snapshot written by someone else returns immediately.
/// The write guard travels with the blocking write, so an abandoned `set`
/// still finishes its rename before the next writer starts.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<State>,
    /// Generation of the snapshot currently on disk.
    persisted: Arc<tokio::sync::Mutex<u64>>,
}

impl CheckpointStore {
    /// Load the store from `path`, creating it if it does not exist yet.
    ///
    /// The file is written back immediately so that an unwritable location
    /// is reported at startup instead of on the first commit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();

        let positions = match File::open(&path) {
            Ok(file) => {
                let file: CheckpointFile = serde_json::from_reader(BufReader::new(file))?;
                if file.version != STATE_VERSION {
                    return Err(CheckpointError::Version(file.version));
                }
                file.containers
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };

        write_atomic(&path, &positions)?;
        log::info!(
            "Loaded {} checkpoint(s) from {}",
            positions.len(),
            path.display()
        );

        Ok(Self {
            path,
            state: Mutex::new(State {
                positions,
                generation: 0,
            }),
            persisted: Arc::new(tokio::sync::Mutex::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, container_id: &str) -> Position {
        self.state
            .lock()
            .expect("Poisoned checkpoint mutex")
            .positions
            .get(container_id)
            .copied()
            .unwrap_or(Position::BEGINNING)
    }

    /// Record `position` for `container_id` and persist it.
    ///
    /// When this returns `Ok` the position is on disk. On error the position
    /// stays in memory and will be written by the next successful commit.
    pub async fn set(&self, container_id: &str, position: Position) -> Result<(), CheckpointError> {
        let generation = {
            let mut state = self.state.lock().expect("Poisoned checkpoint mutex");
            state.positions.insert(container_id.to_string(), position);
            state.generation += 1;
            state.generation
        };

        let mut persisted = Arc::clone(&self.persisted).lock_owned().await;
        if *persisted >= generation {
            return Ok(());
        }

        let (snapshot, snapshot_generation) = {
            let state = self.state.lock().expect("Poisoned checkpoint mutex");
            (state.positions.clone(), state.generation)
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            write_atomic(&path, &snapshot)?;
            *persisted = snapshot_generation;
            Ok::<(), CheckpointError>(())
        })
        .await?
    }
}

fn write_atomic(path: &Path, positions: &HashMap<String, Position>) -> Result<(), CheckpointError> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }
    }

    let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(format!(".tmp.{}.{}", std::process::id(), unique));
    let temp_path = path.with_file_name(temp_name);

    let result = (|| {
        let file = File::create(&temp_path).map_err(|e| CheckpointError::io(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(
            &mut writer,
            &CheckpointFileRef {
                version: STATE_VERSION,
                containers: positions,
            },
        )?;
        writer.flush().map_err(|e| CheckpointError::io(&temp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| CheckpointError::io(&temp_path, e))?;
        drop(writer);
        fs::rename(&temp_path, path).map_err(|e| CheckpointError::io(path, e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[derive(Serialize)]
struct CheckpointFileRef<'a> {
    version: u32,
    containers: &'a HashMap<String, Position>,
}
