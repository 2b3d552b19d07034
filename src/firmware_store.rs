use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use tokio::fs;
use tokio::sync::Mutex;

use crate::api::backend::{Backend, DownloadProgress};
use crate::{Error, Result};

/// Local cache of firmware binaries, one file per URL file name.
///
/// Fetches run one at a time so sessions that need the same binary at
/// once download it only once.
#[derive(Clone, Debug)]
pub struct FirmwareStore {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FirmwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FirmwareStore {
            dir: dir.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Last path segment of `url`, without query or fragment.
    pub fn file_name(url: &str) -> Option<&str> {
        let path = url.split(['?', '#']).next()?;
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    pub fn path_for(&self, url: &str) -> Option<PathBuf> {
        Self::file_name(url).map(|name| self.dir.join(name))
    }

    pub async fn fetch(
        &self,
        backend: &dyn Backend,
        url: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<Bytes> {
        let path = self
            .path_for(url)
            .ok_or_else(|| Error::Config(format!("firmware url has no file name: {url}")))?;

        let _guard = self.lock.lock().await;

        if fs::try_exists(&path).await? {
            debug!("Using cached firmware {}", path.display());
            return Ok(Bytes::from(fs::read(&path).await?));
        }

        info!("Downloading firmware {url}");
        let binary = backend.download_firmware(url, progress).await?;
        fs::create_dir_all(&self.dir).await?;
        // Only a complete image may appear under the cached name.
        let partial = path.with_extension("part");
        fs::write(&partial, &binary).await?;
        fs::rename(&partial, &path).await?;
        debug!("Cached {} bytes at {}", binary.len(), path.display());
        Ok(Bytes::from(binary))
    }
}
