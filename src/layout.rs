use crate::config::Identity;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name of the directory under home that holds all traces.
const BASE_DIR: &str = "profiler";

/// Manages the `{home}/profiler/{env}/{component}/` layout.
///
/// The same relative path is mirrored as the remote object key, so the
/// bucket has the same structure as the local tree.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    home: PathBuf,
    env_name: String,
    component: String,
}

impl OutputLayout {
    pub fn new(home: impl Into<PathBuf>, env_name: &str, component: &str) -> Self {
        Self {
            home: home.into(),
            env_name: env_name.to_string(),
            component: component.to_string(),
        }
    }

    pub fn from_identity(identity: &Identity) -> Self {
        Self::new(
            &identity.home,
            &identity.env_name,
            identity.component.name(),
        )
    }

    /// `profiler/{env}/{component}`, relative to home.
    pub fn relative_dir(&self) -> PathBuf {
        Path::new(BASE_DIR)
            .join(&self.env_name)
            .join(&self.component)
    }

    /// Absolute directory the traces for this role are written to.
    pub fn output_dir(&self) -> PathBuf {
        self.home.join(self.relative_dir())
    }

    /// Path to a trace file in the output directory.
    pub fn trace_path(&self, file_name: &str) -> PathBuf {
        self.output_dir().join(file_name)
    }

    /// Object key for a trace file: `profiler/{env}/{component}/{file}`.
    ///
    /// Always `/`-separated, whatever the local platform uses.
    pub fn remote_key(&self, file_name: &str) -> String {
        format!(
            "{BASE_DIR}/{}/{}/{file_name}",
            self.env_name, self.component
        )
    }

    /// Singleton lock file, kept outside the swept directory.
    pub fn lock_path(&self) -> PathBuf {
        self.home
            .join(BASE_DIR)
            .join(format!(".{}-{}.lock", self.env_name, self.component))
    }

    /// Create the output directory if missing. Idempotent.
    pub fn ensure_output_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.output_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Errors taking the singleton lock.
#[derive(Debug)]
pub enum LockError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another daemon already owns this role-scoped directory.
    Held { path: PathBuf },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Io { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::Held { path } => write!(
                f,
                "another profiler already holds {}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Io { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}

impl OutputLayout {
    /// Take an exclusive lock on this layout's lock file.
    ///
    /// The lock is released when the returned file is dropped.
    pub fn acquire_lock(&self) -> Result<File, LockError> {
        let path = self.lock_path();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;
        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held { path });
        }
        Ok(file)
    }
}
