use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::download_spec::MediaKind;

/// Hex characters per job id: 48 bits of randomness.
pub const JOB_ID_LEN: usize = 12;
const MAX_RESERVE_ATTEMPTS: usize = 16;
const MAX_FILENAME_LEN: usize = 255;
const INCOMPLETE_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact not found")]
    NotFound,
    #[error("could not reserve a unique job id after {0} attempts")]
    IdsExhausted(usize),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity and destination handed out for one job before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: String,
    pub filename: String,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Owns the managed download directory shared by all jobs.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    reserved: Mutex<HashSet<String>>,
}

impl ArtifactStore {
    /// Creates the directory if needed and pins its canonical path.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let root = tokio::fs::canonicalize(dir).await?;

        Ok(Self {
            root,
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn reserve(&self, kind: MediaKind) -> Result<Reservation, StoreError> {
        self.reserve_from(kind, random_job_id).await
    }

    async fn reserve_from(
        &self,
        kind: MediaKind,
        mut next_id: impl FnMut() -> String + Send,
    ) -> Result<Reservation, StoreError> {
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let job_id = next_id();
            if self.id_in_directory(&job_id).await? {
                debug!("Id {job_id} ya existe en la carpeta de descargas, generando otro");
                continue;
            }
            if !self.reserved.lock().insert(job_id.clone()) {
                continue;
            }

            let filename = format!("{job_id}.{}", kind.extension());
            let output_path = self.root.join(&filename);
            return Ok(Reservation {
                job_id,
                filename,
                output_path,
            });
        }

        Err(StoreError::IdsExhausted(MAX_RESERVE_ATTEMPTS))
    }

    /// Forgets an in-process reservation once its job has finished. Whatever
    /// the job wrote keeps the id taken through the directory check.
    pub fn release(&self, reservation: &Reservation) {
        self.reserved.lock().remove(&reservation.job_id);
    }

    async fn id_in_directory(&self, job_id: &str) -> Result<bool, StoreError> {
        let prefix = format!("{job_id}.");
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == job_id || name.starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Finds the file a finished job produced. Tries the path the tool printed,
    /// then the reserved path, then any complete file named `<job_id>.*`.
    pub async fn locate_output(
        &self,
        reservation: &Reservation,
        printed_path: Option<&str>,
    ) -> Result<Artifact, StoreError> {
        if let Some(printed) = printed_path {
            let printed = PathBuf::from(printed);
            let candidate = if printed.is_absolute() {
                printed
            } else {
                self.root.join(printed)
            };
            if let Some(artifact) = self.contained_file(&candidate).await? {
                return Ok(artifact);
            }
        }

        if let Some(artifact) = self.contained_file(&reservation.output_path).await? {
            return Ok(artifact);
        }

        let prefix = format!("{}.", reservation.job_id);
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix)
                || INCOMPLETE_SUFFIXES
                    .iter()
                    .any(|suffix| name.ends_with(suffix))
            {
                continue;
            }
            if let Some(artifact) = self.contained_file(&entry.path()).await? {
                return Ok(artifact);
            }
        }

        Err(StoreError::NotFound)
    }

    /// Resolves a caller-supplied filename. The input is an opaque token: any
    /// separator or traversal sequence is rejected, and the canonical path must
    /// still sit inside the managed directory.
    pub async fn resolve(&self, filename: &str) -> Result<Artifact, StoreError> {
        if !is_safe_filename(filename) {
            warn!("Nombre de archivo rechazado: {filename:?}");
            return Err(StoreError::NotFound);
        }

        self.contained_file(&self.root.join(filename))
            .await?
            .ok_or(StoreError::NotFound)
    }

    /// Deletes every entry in the managed directory. Returns how many were removed.
    pub async fn purge_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        self.reserved.lock().clear();
        Ok(removed)
    }

    async fn contained_file(&self, candidate: &Path) -> Result<Option<Artifact>, StoreError> {
        let canonical = match tokio::fs::canonicalize(candidate).await {
            Ok(path) => path,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        if canonical.parent() != Some(self.root.as_path()) {
            warn!(
                "Se bloqueo un archivo fuera de la carpeta de descargas: {:?}",
                canonical
            );
            return Ok(None);
        }

        let metadata = tokio::fs::metadata(&canonical).await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let Some(filename) = canonical
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
        else {
            return Ok(None);
        };

        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(Artifact {
            filename,
            path: canonical,
            size: metadata.len(),
            created_at,
        }))
    }
}

fn random_job_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(JOB_ID_LEN);
    id
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_'))
}
