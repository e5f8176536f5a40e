use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use fedlink_core::task::Fab;

/// Resolves application bundles by content hash. The Fleet servicer
/// only routes; where the bytes live is the provider's business.
#[async_trait]
pub trait FabProvider: Send + Sync {
    async fn get(&self, hash_str: &str) -> Result<Option<Fab>>;
}

/// Disk-backed provider reading `<fab_dir>/<hash>.fab` and verifying
/// the content against its name before handing it out.
pub struct DiskFabProvider {
    fab_dir: PathBuf,
}

impl DiskFabProvider {
    pub fn new(fab_dir: impl Into<PathBuf>) -> Self {
        Self {
            fab_dir: fab_dir.into(),
        }
    }

    /// Application directory resolution: `FEDLINK_HOME` override, else
    /// `~/.fedlink`.
    pub fn from_env() -> Self {
        let base = std::env::var("FEDLINK_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".fedlink")
            });
        Self::new(base.join("fab"))
    }
}

#[async_trait]
impl FabProvider for DiskFabProvider {
    async fn get(&self, hash_str: &str) -> Result<Option<Fab>> {
        let path = self.fab_dir.join(format!("{hash_str}.fab"));
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let digest = hex::encode(Sha256::digest(&content));
        ensure!(
            digest == hash_str,
            "bundle at {} does not match its content hash",
            path.display()
        );
        Ok(Some(Fab {
            hash_str: hash_str.to_string(),
            content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_provider_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"bundle bytes".to_vec();
        let hash = hex::encode(Sha256::digest(&content));
        std::fs::write(dir.path().join(format!("{hash}.fab")), &content).unwrap();

        let provider = DiskFabProvider::new(dir.path());
        let fab = provider.get(&hash).await.unwrap().unwrap();
        assert_eq!(fab.hash_str, hash);
        assert_eq!(fab.content, content);

        assert!(provider.get("0000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_provider_rejects_mismatched_content() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hex::encode(Sha256::digest(b"original"));
        std::fs::write(dir.path().join(format!("{hash}.fab")), b"tampered").unwrap();

        let provider = DiskFabProvider::new(dir.path());
        assert!(provider.get(&hash).await.is_err());
    }
}
