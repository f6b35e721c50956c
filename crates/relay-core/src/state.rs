use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

use crate::types::PipelineState;

/// Directory that holds all engine data inside a repository.
pub const DATA_DIR: &str = ".agent-pipeline";

/// Durable store for run state, keyed by runId.
///
/// Writes are tmp-then-rename in the same directory so readers never observe
/// a partial file; on crash the last completed write wins.
pub struct StateStore {
    runs_dir: PathBuf,
}

impl StateStore {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: repo_root.as_ref().join(DATA_DIR).join("state").join("runs"),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    /// First persistence of a new run. Rejects a runId that already exists.
    pub fn create(&self, state: &PipelineState) -> Result<()> {
        let path = self.run_path(&state.run_id);
        if path.exists() {
            anyhow::bail!("run {} already persisted at {}", state.run_id, path.display());
        }
        self.save(state)
    }

    /// Atomic replace of the on-disk record.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("create {}", self.runs_dir.display()))?;

        let json = serde_json::to_vec_pretty(state).context("serialize run state")?;
        let path = self.run_path(&state.run_id);
        let tmp = self.runs_dir.join(format!(".{}.json.tmp", state.run_id));

        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        sync_dir(&self.runs_dir);

        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Option<PipelineState>> {
        let path = self.run_path(run_id);
        let contents = match fs::read_to_string(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
            Ok(c) => c,
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(state))
    }

    /// Most recent persisted run across all pipelines, by startTime.
    pub fn latest_run(&self) -> Result<Option<PipelineState>> {
        Ok(self
            .list(None)?
            .into_iter()
            .max_by_key(|s| s.start_time))
    }

    /// All persisted runs, optionally filtered by pipeline name. Unreadable
    /// entries are skipped with a warning rather than failing the listing.
    pub fn list(&self, pipeline: Option<&str>) -> Result<Vec<PipelineState>> {
        let entries = match fs::read_dir(&self.runs_dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.runs_dir.display())),
            Ok(entries) => entries,
        };

        let mut states = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            let contents = match fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(e) => {
                    warn!("state: skipping unreadable {}: {e}", name);
                    continue;
                }
            };
            match serde_json::from_str::<PipelineState>(&contents) {
                Ok(state) => {
                    if pipeline.map_or(true, |p| state.pipeline_config.name == p) {
                        states.push(state);
                    }
                }
                Err(e) => warn!("state: skipping malformed {}: {e}", name),
            }
        }

        states.sort_by_key(|s| s.start_time);
        Ok(states)
    }
}

/// fsync the directory so the rename itself is durable. Failure is logged,
/// not fatal: the data file already hit disk.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir) {
            Ok(f) => {
                if let Err(e) = f.sync_all() {
                    warn!("state: fsync {}: {e}", dir.display());
                }
            }
            Err(e) => warn!("state: open {} for fsync: {e}", dir.display()),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// Append-only log per pipeline name (not per run), ISO-timestamped lines.
pub struct RunLogger {
    path: PathBuf,
}

impl RunLogger {
    pub fn new(repo_root: impl AsRef<Path>, pipeline: &str) -> Self {
        Self {
            path: repo_root
                .as_ref()
                .join(DATA_DIR)
                .join("logs")
                .join(format!("{pipeline}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Logging never fails the run; errors go to tracing.
    pub fn log(&self, message: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("runlog: create {}: {e}", parent.display());
                return;
            }
        }
        let line = format!("{} {message}\n", Utc::now().to_rfc3339());
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("runlog: append {}: {e}", self.path.display());
        }
    }
}
