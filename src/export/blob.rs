//! Blob stores for video snippets.

use anyhow::{anyhow, Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;

use super::BlobStore;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// `PUT {container}/{path}[?sas]` with block-blob semantics.
pub struct HttpBlobStore {
    container: Url,
    sas_token: Option<String>,
    agent: ureq::Agent,
}

impl HttpBlobStore {
    pub fn new(container_url: &str, sas_token: Option<&str>) -> Result<Self> {
        let container = Url::parse(container_url)
            .with_context(|| format!("parse blob container url {}", container_url))?;
        match container.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported blob store scheme '{}'", other)),
        }
        let sas_token = sas_token
            .map(|t| t.trim().trim_start_matches('?').to_string())
            .filter(|t| !t.is_empty());
        Ok(Self {
            container,
            sas_token,
            agent: ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build(),
        })
    }

    /// Object URL without credentials.
    pub fn object_url(&self, path: &str) -> Result<Url> {
        let mut url = self.container.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("blob container {} cannot take a path", self.container))?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }
}

impl BlobStore for HttpBlobStore {
    fn put(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
        let object = self.object_url(path)?;
        let mut target = object.clone();
        if let Some(sas) = self.sas_token.as_deref() {
            target.set_query(Some(sas));
        }
        self.agent
            .put(target.as_str())
            .set("x-ms-blob-type", "BlockBlob")
            .set("Content-Type", content_type)
            .send_bytes(bytes)
            .map_err(|err| anyhow!("upload to {} failed: {}", object, err))?;
        Ok(object.to_string())
    }
}

/// Writes blobs under a local directory.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("blob path {} must be relative without '..'", path));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, path: &str, _content_type: &str, bytes: &[u8]) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create blob directory {}", parent.display()))?;
        }
        let partial = target.with_extension("partial");
        std::fs::write(&partial, bytes)
            .with_context(|| format!("write blob {}", partial.display()))?;
        std::fs::rename(&partial, &target)
            .with_context(|| format!("move blob into place at {}", target.display()))?;
        Ok(target.display().to_string())
    }
}
