//! Root image resolution
//!
//! Instance types name their root image as a local path, an `http(s)://`
//! URL or a `docker://` registry reference. URLs are downloaded into
//! `<base_dir>/imagecache/` and re-fetched only when the server reports a
//! newer copy; registry references go to the container runtime untouched.

use crate::error::{FactoryError, Result};
use crate::store::{mtime_secs, AtomicWriter};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

pub const REGISTRY_SCHEME: &str = "docker://";

const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Parsed `root_image` setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Local(PathBuf),
    Remote(Url),
    Registry(String),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.starts_with(REGISTRY_SCHEME) {
            return Ok(Self::Registry(reference.to_string()));
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            let url = Url::parse(reference).map_err(|e| {
                FactoryError::Config(format!("invalid image URL {:?}: {}", reference, e))
            })?;
            return Ok(Self::Remote(url));
        }
        if reference.starts_with('/') {
            return Ok(Self::Local(PathBuf::from(reference)));
        }
        Err(FactoryError::Config(format!(
            "root image {:?} is neither an absolute path, a URL nor a {} reference",
            reference, REGISTRY_SCHEME
        )))
    }
}

/// `Last-Modified` / `If-Modified-Since` form of a UNIX time
pub fn http_date(secs: i64) -> Option<String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.timestamp())
}

/// Cache file name for a URL
pub fn cache_key(url: &Url) -> String {
    hex::encode(Sha256::digest(url.as_str().as_bytes()))
}

/// Resolves image references to something a backend can use
pub struct ImageCache {
    dir: PathBuf,
    client: reqwest::Client,
    /// One download at a time per URL
    fetches: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| FactoryError::resource("image", e.to_string()))?;
        Ok(Self {
            dir: dir.into(),
            client,
            fetches: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local path or registry reference for `reference`
    pub async fn resolve(&self, reference: &str) -> Result<String> {
        match ImageRef::parse(reference)? {
            ImageRef::Registry(name) => Ok(name),
            ImageRef::Local(path) => {
                if path.is_file() {
                    Ok(path.to_string_lossy().to_string())
                } else {
                    Err(FactoryError::resource(
                        "image",
                        format!("{} does not exist", path.display()),
                    ))
                }
            }
            ImageRef::Remote(url) => {
                let path = self.fetch(&url).await?;
                Ok(path.to_string_lossy().to_string())
            }
        }
    }

    /// Download `url` unless the cached copy is current
    ///
    /// A failed re-fetch falls back to an existing cached copy.
    pub async fn fetch(&self, url: &Url) -> Result<PathBuf> {
        let key = cache_key(url);
        let lock = self
            .fetches
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let path = self.dir.join(&key);
        let cached = mtime_secs(&path);
        match self.download(url, &path, cached).await {
            Ok(()) => Ok(path),
            Err(e) if cached.is_some() => {
                warn!(url = %url, error = %e, "Image re-fetch failed, using cached copy");
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }

    async fn download(&self, url: &Url, path: &Path, cached: Option<i64>) -> Result<()> {
        let fail = |e: reqwest::Error| FactoryError::resource("image", format!("{}: {}", url, e));

        let mut request = self.client.get(url.clone());
        if let Some(date) = cached.and_then(http_date) {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, date);
        }
        let mut response = request.send().await.map_err(fail)?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!(url = %url, "Cached image is current");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(FactoryError::resource(
                "image",
                format!("{}: HTTP {}", url, response.status()),
            ));
        }

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        std::fs::create_dir_all(&self.dir).map_err(|e| FactoryError::io(&self.dir, e))?;
        let mut writer = AtomicWriter::new(path)?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(fail)? {
            writer.write_all(&chunk)?;
            bytes += chunk.len() as u64;
        }
        writer.commit()?;

        if let Some(secs) = last_modified {
            let when = UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0));
            std::fs::File::options()
                .write(true)
                .open(path)
                .and_then(|f| f.set_modified(when))
                .map_err(|e| FactoryError::io(path, e))?;
        }

        info!(url = %url, bytes = bytes, path = %path.display(), "Fetched image");
        Ok(())
    }
}
