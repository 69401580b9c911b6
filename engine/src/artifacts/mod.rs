//! Artifact persistence
//!
//! Turns produce queries, tables, charts, code and answers. The conductor hands
//! their bytes to an `ArtifactPersistence` implementation and keeps only the
//! returned reference; naming and directory layout live here.
//!
//! `FsArtifactStore` writes `<root>/<session_id>/<kind>_<n>.<ext>` with a
//! sequential counter per session and kind, e.g. `data_0.csv`, `image_1.png`.

use async_trait::async_trait;
use sdk::{ArtifactKind, ArtifactRef, EngineError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors produced while storing or reading artifacts
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid session id for artifact storage: {0}")]
    InvalidSession(String),

    #[error("artifact location outside of the artifact root: {0}")]
    OutsideRoot(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ArtifactError> for EngineError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::NotFound(location) => EngineError::ArtifactNotFound(location),
            other => EngineError::Artifact(other.to_string()),
        }
    }
}

/// Storage for turn outputs
#[async_trait]
pub trait ArtifactPersistence: Send + Sync {
    /// Write an artifact and return a reference to it
    async fn save(
        &self,
        session_id: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<ArtifactRef, ArtifactError>;

    /// Read an artifact back
    async fn load(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError>;

    /// Remove every artifact of a session
    async fn remove_session(&self, session_id: &str) -> Result<(), ArtifactError>;
}

/// File-system artifact store
pub struct FsArtifactStore {
    root: PathBuf,
    counters: Mutex<HashMap<(String, ArtifactKind), u32>>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, ArtifactError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ArtifactError::InvalidSession(session_id.to_string()));
        }
        Ok(self.root.join(session_id))
    }

    /// Next free index for `kind` in `dir`, seeded from files already on disk
    async fn next_index(&self, session_id: &str, kind: ArtifactKind, dir: &Path) -> u32 {
        let mut counters = self.counters.lock().await;
        let key = (session_id.to_string(), kind);

        let next = match counters.get(&key) {
            Some(n) => *n,
            None => existing_count(dir, kind).await,
        };
        counters.insert(key, next + 1);
        next
    }
}

/// Highest `<kind>_<n>` index found in `dir` plus one (0 when none)
async fn existing_count(dir: &Path, kind: ArtifactKind) -> u32 {
    let prefix = format!("{}_", kind.as_str());
    let suffix = format!(".{}", kind.extension());

    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    let mut next = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let index = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    next
}

#[async_trait]
impl ArtifactPersistence for FsArtifactStore {
    async fn save(
        &self,
        session_id: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<ArtifactRef, ArtifactError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: dir.display().to_string(),
                source,
            })?;

        let index = self.next_index(session_id, kind, &dir).await;
        let path = dir.join(format!("{}_{}.{}", kind.as_str(), index, kind.extension()));

        tokio::fs::write(&path, content)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!(session_id, %kind, path = %path.display(), "Artifact written");
        Ok(ArtifactRef::new(kind, path.display().to_string()))
    }

    async fn load(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let path = PathBuf::from(&reference.location);
        if !path.starts_with(&self.root) {
            return Err(ArtifactError::OutsideRoot(reference.location.clone()));
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(reference.location.clone()))
            }
            Err(source) => Err(ArtifactError::Io {
                path: reference.location.clone(),
                source,
            }),
        }
    }

    async fn remove_session(&self, session_id: &str) -> Result<(), ArtifactError> {
        let dir = self.session_dir(session_id)?;
        self.counters
            .lock()
            .await
            .retain(|(session, _), _| session != session_id);

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArtifactError::Io {
                path: dir.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sequential_names_per_kind() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());

        let first = store.save("s1", ArtifactKind::Table, b"a,b\n").await.unwrap();
        let second = store.save("s1", ArtifactKind::Table, b"a,b\n").await.unwrap();
        let image = store.save("s1", ArtifactKind::Image, b"png").await.unwrap();

        assert!(first.location.ends_with("s1/data_0.csv"));
        assert!(second.location.ends_with("s1/data_1.csv"));
        assert!(image.location.ends_with("s1/image_0.png"));
        assert_eq!(store.load(&second).await.unwrap(), b"a,b\n");
    }

    #[tokio::test]
    async fn test_counter_resumes_from_disk() {
        let temp = TempDir::new().unwrap();
        FsArtifactStore::new(temp.path())
            .save("s1", ArtifactKind::Query, b"SELECT 1")
            .await
            .unwrap();

        let reopened = FsArtifactStore::new(temp.path());
        let next = reopened
            .save("s1", ArtifactKind::Query, b"SELECT 2")
            .await
            .unwrap();
        assert!(next.location.ends_with("query_1.sql"));
    }

    #[tokio::test]
    async fn test_rejects_path_like_session_ids() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());

        let result = store.save("../escape", ArtifactKind::Answer, b"x").await;
        assert!(matches!(result, Err(ArtifactError::InvalidSession(_))));
    }

    #[tokio::test]
    async fn test_remove_session() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());
        let reference = store.save("s2", ArtifactKind::Code, b"print(1)").await.unwrap();

        store.remove_session("s2").await.unwrap();
        assert!(matches!(
            store.load(&reference).await,
            Err(ArtifactError::NotFound(_))
        ));
        // Removing twice is fine
        store.remove_session("s2").await.unwrap();
    }
}
