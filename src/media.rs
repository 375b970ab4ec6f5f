//! Media locator: turns the source references found in scene documents
//! (absolute paths, root-relative paths, public URLs) into readable local
//! files under the media root, downloading remote media into a
//! content-addressed cache as a last resort.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use url::Url;
use walkdir::WalkDir;

use crate::config::RemoteConfig;
use crate::error::{RenderError, RenderResult};
use crate::sandbox::MediaSandbox;

const MEDIA_SEGMENT: &str = "/media/";

/// Fetches remote media bytes. Implementations must be shareable across
/// render workers.
pub trait RemoteFetch: Send + Sync {
    fn fetch(&self, url: &Url) -> RenderResult<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> RenderResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reelsmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl RemoteFetch for HttpFetcher {
    fn fetch(&self, url: &Url) -> RenderResult<Vec<u8>> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .with_context(|| format!("failed to download media URL {url}"))?
            .error_for_status()
            .with_context(|| format!("media URL returned an error status: {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read bytes from {url}"))?;
        Ok(bytes.to_vec())
    }
}

pub struct MediaLocator {
    sandbox: MediaSandbox,
    cache_dir: PathBuf,
    fetcher: Option<Box<dyn RemoteFetch>>,
}

impl std::fmt::Debug for MediaLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLocator")
            .field("media_root", &self.sandbox.root())
            .field("cache_dir", &self.cache_dir)
            .field("remote", &self.fetcher.is_some())
            .finish()
    }
}

impl MediaLocator {
    /// Builds a locator with an HTTP fetcher when remote fetching is enabled.
    pub fn new(media_root: &Path, remote: &RemoteConfig) -> RenderResult<Self> {
        let fetcher: Option<Box<dyn RemoteFetch>> = if remote.enabled {
            Some(Box::new(HttpFetcher::new(Duration::from_secs(
                remote.timeout_secs,
            ))?))
        } else {
            None
        };
        Self::with_fetcher(media_root, &remote.cache_dir_name, fetcher)
    }

    pub fn with_fetcher(
        media_root: &Path,
        cache_dir_name: &str,
        fetcher: Option<Box<dyn RemoteFetch>>,
    ) -> RenderResult<Self> {
        let sandbox = MediaSandbox::new(media_root)?;
        let cache_dir = sandbox.root().join(cache_dir_name);
        Ok(Self {
            sandbox,
            cache_dir,
            fetcher,
        })
    }

    pub fn media_root(&self) -> &Path {
        self.sandbox.root()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolves a source reference to a local file. Strategies run in order
    /// and the first hit wins: absolute path, text after a `/media/` segment,
    /// root-relative path, bare filename at the root, recursive filename
    /// search, and finally an HTTP(S) download into the cache.
    pub fn resolve(&self, reference: &str) -> RenderResult<PathBuf> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(RenderError::media_not_found(reference));
        }

        let url = parse_url(trimmed);
        let path_text = match &url {
            Some(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_else(|_| url.path().to_owned()),
            Some(url) => url.path().to_owned(),
            None => trimmed.replace('\\', "/"),
        };
        let candidates = decoded_variants(&path_text);

        for (strategy, found) in [
            ("absolute", self.find_absolute(&url, &candidates)),
            ("media-segment", self.find_after_media_segment(&candidates)),
            ("root-relative", self.find_root_relative(&url, &candidates)),
            ("bare-filename", self.find_bare_filename(&candidates)),
            ("recursive-search", self.find_recursive(&candidates)),
        ] {
            if let Some(path) = found {
                tracing::debug!(reference, strategy, path = %path.display(), "resolved media");
                return Ok(path);
            }
        }

        match url {
            Some(url) if matches!(url.scheme(), "http" | "https") => self.fetch_cached(reference, &url),
            Some(url) if url.scheme() != "file" => Err(RenderError::unsupported(
                reference,
                format!("scheme '{}' is not fetchable", url.scheme()),
            )),
            _ => Err(RenderError::media_not_found(reference)),
        }
    }

    fn find_absolute(&self, url: &Option<Url>, candidates: &[String]) -> Option<PathBuf> {
        if matches!(url, Some(url) if url.scheme() != "file") {
            return None;
        }
        candidates
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_absolute() && path.is_file())
    }

    fn find_after_media_segment(&self, candidates: &[String]) -> Option<PathBuf> {
        candidates.iter().find_map(|candidate| {
            let index = candidate.rfind(MEDIA_SEGMENT)?;
            let relative = &candidate[index + MEDIA_SEGMENT.len()..];
            self.sandbox.resolve_file(relative)
        })
    }

    fn find_root_relative(&self, url: &Option<Url>, candidates: &[String]) -> Option<PathBuf> {
        if url.is_some() {
            return None;
        }
        candidates.iter().find_map(|candidate| {
            let without_dot = candidate.trim_start_matches("./");
            let without_media = without_dot.strip_prefix("media/").unwrap_or(without_dot);
            self.sandbox
                .resolve_file(without_dot)
                .or_else(|| self.sandbox.resolve_file(without_media))
        })
    }

    fn find_bare_filename(&self, candidates: &[String]) -> Option<PathBuf> {
        candidates
            .iter()
            .filter_map(|candidate| file_name_of(candidate))
            .find_map(|name| self.sandbox.resolve_file(name))
    }

    fn find_recursive(&self, candidates: &[String]) -> Option<PathBuf> {
        let names = candidates
            .iter()
            .filter_map(|candidate| file_name_of(candidate))
            .collect::<Vec<_>>();
        if names.is_empty() {
            return None;
        }
        WalkDir::new(self.sandbox.root())
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .find(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| names.contains(&name))
            })
            .map(|entry| entry.into_path())
    }

    /// Downloads `url` into `<cache_dir>/<sha256(reference)>.<ext>` unless
    /// that entry already exists. The file is written to a temporary sibling
    /// and atomically renamed, so concurrent writers race harmlessly and
    /// readers never observe a partial file.
    fn fetch_cached(&self, reference: &str, url: &Url) -> RenderResult<PathBuf> {
        let target = self.cache_dir.join(cache_file_name(reference, url));
        if target.is_file() {
            tracing::info!(reference, path = %target.display(), "remote media cache hit");
            return Ok(target);
        }

        let Some(fetcher) = &self.fetcher else {
            tracing::warn!(reference, "remote fetching disabled; media unresolved");
            return Err(RenderError::media_not_found(reference));
        };
        let bytes = match fetcher.fetch(url) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(reference, error = %error, "remote media fetch failed");
                return Err(RenderError::media_not_found(reference));
            }
        };

        fs::create_dir_all(&self.cache_dir)
            .map_err(|error| RenderError::io(&self.cache_dir, error))?;
        let mut staging = NamedTempFile::new_in(&self.cache_dir)
            .map_err(|error| RenderError::io(&self.cache_dir, error))?;
        staging
            .write_all(&bytes)
            .and_then(|_| staging.as_file().sync_all())
            .map_err(|error| RenderError::io(staging.path(), error))?;
        staging
            .persist(&target)
            .map_err(|error| RenderError::io(&target, error.error))?;

        tracing::info!(reference, bytes = bytes.len(), path = %target.display(), "downloaded remote media");
        Ok(target)
    }
}

/// Windows drive letters (`C:/...`) parse as one-letter schemes; those are
/// treated as plain paths.
fn parse_url(reference: &str) -> Option<Url> {
    Url::parse(reference)
        .ok()
        .filter(|url| url.scheme().len() > 1)
}

fn decoded_variants(path_text: &str) -> Vec<String> {
    let mut variants = vec![path_text.to_owned()];
    if let Ok(decoded) = urlencoding::decode(path_text) {
        if decoded != path_text {
            variants.push(decoded.into_owned());
        }
    }
    variants
}

fn file_name_of(candidate: &str) -> Option<&str> {
    candidate
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

fn cache_file_name(reference: &str, url: &Url) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    let hash = format!("{digest:x}");
    let extension = Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        body: Option<Vec<u8>>,
    }

    impl RemoteFetch for CountingFetcher {
        fn fetch(&self, url: &Url) -> RenderResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body
                .clone()
                .ok_or_else(|| anyhow::anyhow!("404 for {url}").into())
        }
    }

    fn locator_with(root: &Path, body: Option<&[u8]>) -> (MediaLocator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = CountingFetcher {
            calls: Arc::clone(&calls),
            body: body.map(<[u8]>::to_vec),
        };
        let locator = MediaLocator::with_fetcher(root, ".remote-cache", Some(Box::new(fetcher)))
            .expect("locator should build");
        (locator, calls)
    }

    fn touch(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"media").unwrap();
        fs::canonicalize(path).unwrap()
    }

    #[test]
    fn media_segment_url_resolves_locally_without_network() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "co1/logo.png");
        let (locator, calls) = locator_with(dir.path(), Some(b"remote"));

        let resolved = locator.resolve("https://host/media/co1/logo.png").unwrap();
        assert_eq!(resolved, expected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn percent_encoded_names_are_decoded() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "co1/test video.mp4");
        let (locator, _) = locator_with(dir.path(), None);

        let resolved = locator
            .resolve("https://host/media/co1/test%20video.mp4")
            .unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn relative_prefixes_are_stripped() {
        let dir = tempdir().unwrap();
        let expected = touch(dir.path(), "co1/intro.mp4");
        let (locator, _) = locator_with(dir.path(), None);

        for reference in ["co1/intro.mp4", "./co1/intro.mp4", "media/co1/intro.mp4", "./media/co1/intro.mp4"] {
            assert_eq!(locator.resolve(reference).unwrap(), expected, "{reference}");
        }
    }

    #[test]
    fn absolute_paths_win_first() {
        let media = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let absolute = touch(elsewhere.path(), "clip.mp4");
        let (locator, _) = locator_with(media.path(), None);

        let resolved = locator.resolve(absolute.to_str().unwrap()).unwrap();
        assert_eq!(resolved, absolute);
    }

    #[test]
    fn bare_and_nested_filenames_are_found() {
        let dir = tempdir().unwrap();
        let at_root = touch(dir.path(), "music.mp3");
        let nested = touch(dir.path(), "co9/uploads/deep/banner.jpg");
        let (locator, _) = locator_with(dir.path(), None);

        assert_eq!(locator.resolve("old/place/music.mp3").unwrap(), at_root);
        assert_eq!(locator.resolve("banner.jpg").unwrap(), nested);
    }

    #[test]
    fn remote_media_downloads_once_then_hits_cache() {
        let dir = tempdir().unwrap();
        let (locator, calls) = locator_with(dir.path(), Some(b"png-bytes"));

        let first = locator.resolve("https://cdn.example.com/assets/hero.PNG").unwrap();
        let second = locator.resolve("https://cdn.example.com/assets/hero.PNG").unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.starts_with(locator.cache_dir()));
        assert!(locator.cache_dir().starts_with(locator.media_root()));
        assert_eq!(locator.media_root(), fs::canonicalize(dir.path()).unwrap());
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(fs::read(&first).unwrap(), b"png-bytes");
    }

    #[test]
    fn failed_download_is_media_not_found() {
        let dir = tempdir().unwrap();
        let (locator, calls) = locator_with(dir.path(), None);

        let err = locator.resolve("https://cdn.example.com/missing.png").unwrap_err();
        assert!(matches!(err, RenderError::MediaNotFound { ref reference } if reference == "https://cdn.example.com/missing.png"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!locator.cache_dir().exists() || fs::read_dir(locator.cache_dir()).unwrap().next().is_none());
    }

    #[test]
    fn remote_disabled_is_media_not_found() {
        let dir = tempdir().unwrap();
        let locator = MediaLocator::with_fetcher(dir.path(), ".remote-cache", None).unwrap();
        let err = locator.resolve("https://cdn.example.com/a.png").unwrap_err();
        assert_eq!(err.code(), "MEDIA_NOT_FOUND");
    }

    #[test]
    fn non_http_schemes_are_unsupported() {
        let dir = tempdir().unwrap();
        let (locator, calls) = locator_with(dir.path(), Some(b"x"));
        let err = locator.resolve("ftp://files.example.com/a.png").unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_REFERENCE");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_local_reference_is_media_not_found() {
        let dir = tempdir().unwrap();
        let (locator, _) = locator_with(dir.path(), None);
        let err = locator.resolve("./media/nowhere/ghost.mp4").unwrap_err();
        assert!(err.to_string().contains("./media/nowhere/ghost.mp4"));
    }

    #[test]
    fn traversal_outside_root_is_not_resolved() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("media");
        fs::create_dir(&root).unwrap();
        fs::write(parent.path().join("secret.txt"), b"x").unwrap();
        let (locator, _) = locator_with(&root, None);
        assert!(locator.resolve("../secret.txt").is_err());
    }
}
