//! Product image downloads.
//!
//! Downloads run with bounded concurrency and a small stagger so ten
//! simultaneous fetches don't hammer one CDN. Known CDN families get
//! sibling-host substitution between attempts; content is format-sniffed and
//! persisted under random names in a registered temp directory.

use crate::errors::ApiError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const MAX_CONCURRENT_DOWNLOADS: usize = 5;
const STAGGER_DELAY: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Anything below this is an error page or a broken thumbnail.
const MIN_CONTENT_BYTES: usize = 1024;

/// Sibling hosts for the alicdn CDN family, tried in order.
const ALICDN_ALTERNATIVES: &[&str] = &["img.alicdn.com", "gw.alicdn.com", "cbu01.alicdn.com"];

/// Directories holding downloaded files, purgeable between runs.
fn temp_dir_registry() -> &'static Mutex<Vec<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Remove every file from every registered temp directory.
pub fn purge_temp_dirs() -> usize {
    let dirs = temp_dir_registry().lock().clone();
    let mut removed = 0;
    for dir in dirs {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().is_file() && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download one image; the result is an absolute path in the temp store.
    async fn download(&self, url: &str) -> Result<PathBuf, ApiError>;

    /// Download a batch with bounded concurrency; results stay parallel to
    /// the input order.
    async fn download_batch(&self, urls: &[String]) -> Vec<Result<PathBuf, ApiError>>;
}

/// Detected image format, in sniffing priority order: Content-Type header,
/// magic bytes, URL extension, default JPEG.
fn detect_format(content_type: Option<&str>, data: &[u8], url: &str) -> &'static str {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or("").trim().to_lowercase();
        match ct.as_str() {
            "image/jpeg" => return "jpg",
            "image/png" => return "png",
            "image/webp" => return "webp",
            _ => {}
        }
    }

    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return "jpg";
    }
    if data.starts_with(b"\x89PNG") {
        return "png";
    }
    if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WEBP".as_slice()) {
        return "webp";
    }

    let path = url.split('?').next().unwrap_or("").to_lowercase();
    if path.ends_with(".png") {
        return "png";
    }
    if path.ends_with(".webp") {
        return "webp";
    }

    "jpg"
}

/// Char-safe prefix for log lines.
fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Original URL plus CDN-sibling rewrites worth trying.
fn alternative_urls(url: &str) -> Vec<String> {
    let mut urls = vec![url.to_string()];
    if !url.contains("alicdn.com") {
        return urls;
    }

    static HOST_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = HOST_RE.get_or_init(|| {
        regex::Regex::new(r"(gd\d|img|gw|cbu\d+)\.alicdn\.com").unwrap()
    });

    for alt_host in ALICDN_ALTERNATIVES {
        let rewritten = re.replace(url, *alt_host).into_owned();
        if rewritten != url && !urls.contains(&rewritten) {
            urls.push(rewritten);
        }
    }
    urls
}

pub struct ImageDownloader {
    client: reqwest::Client,
    temp_dir: PathBuf,
}

impl ImageDownloader {
    pub fn new(client: reqwest::Client, temp_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&temp_dir)?;
        temp_dir_registry().lock().push(temp_dir.clone());
        Ok(Self { client, temp_dir })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ApiError> {
        let mut last_error = ApiError::Transient(format!("{url}: no attempt made"));

        for candidate in alternative_urls(url) {
            for attempt in 1..=MAX_ATTEMPTS {
                debug!("downloading {} (attempt {})", clip(&candidate, 80), attempt);

                let result = self
                    .client
                    .get(&candidate)
                    .timeout(READ_TIMEOUT)
                    .send()
                    .await;

                match result {
                    Ok(response) if response.status().is_success() => {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        match response.bytes().await {
                            Ok(bytes) if bytes.len() >= MIN_CONTENT_BYTES => {
                                return Ok((bytes.to_vec(), content_type));
                            }
                            Ok(bytes) => {
                                // Undersized content is permanent for this URL
                                last_error = ApiError::BusinessRule(format!(
                                    "image too small: {} bytes",
                                    bytes.len()
                                ));
                                break;
                            }
                            Err(e) => last_error = e.into(),
                        }
                    }
                    Ok(response) => {
                        let status = response.status();
                        last_error = if status.is_server_error() {
                            ApiError::Transient(format!("image fetch: HTTP {status}"))
                        } else {
                            ApiError::Permanent {
                                status: status.as_u16(),
                                body: format!("image fetch {candidate}"),
                            }
                        };
                        if !last_error.is_transient() {
                            break;
                        }
                    }
                    Err(e) => last_error = e.into(),
                }

                if attempt < MAX_ATTEMPTS {
                    sleep(RETRY_DELAY * attempt).await;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ImageFetcher for ImageDownloader {
    async fn download(&self, url: &str) -> Result<PathBuf, ApiError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ApiError::BusinessRule(format!("invalid image url: {url}")));
        }

        let (data, content_type) = self.fetch_bytes(url).await?;
        let format = detect_format(content_type.as_deref(), &data, url);

        let filename = format!("{}.{}", uuid::Uuid::new_v4().simple(), format);
        let path = self.temp_dir.join(filename);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| ApiError::BusinessRule(format!("writing {}: {e}", path.display())))?;

        info!(
            "downloaded {} ({} KiB, {})",
            clip(url, 80),
            data.len() / 1024,
            format
        );
        Ok(path)
    }

    async fn download_batch(&self, urls: &[String]) -> Vec<Result<PathBuf, ApiError>> {
        let futures: Vec<_> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                Box::pin(async move {
                    // Stagger task starts to spread CDN load
                    sleep(STAGGER_DELAY * (i as u32 % MAX_CONCURRENT_DOWNLOADS as u32)).await;
                    self.download(url).await
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<PathBuf, ApiError>> + Send + '_>>
            })
            .collect();
        stream::iter(futures)
            .buffered(MAX_CONCURRENT_DOWNLOADS)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_priority_order() {
        let jpeg_magic = [0xff, 0xd8, 0xff, 0xe0];
        // Header wins over magic bytes
        assert_eq!(detect_format(Some("image/png"), &jpeg_magic, "x.webp"), "png");
        // Magic bytes win over extension
        assert_eq!(detect_format(None, &jpeg_magic, "x.webp"), "jpg");
        // Extension when nothing else matches
        assert_eq!(detect_format(None, b"????", "https://a/b.png?x=1"), "png");
        // Default
        assert_eq!(detect_format(None, b"????", "https://a/b"), "jpg");
    }

    #[test]
    fn webp_magic_requires_riff_and_webp() {
        let mut webp = b"RIFF\x00\x00\x00\x00WEBPVP8 ".to_vec();
        assert_eq!(detect_format(None, &webp, ""), "webp");
        webp[8..12].copy_from_slice(b"WAVE");
        assert_eq!(detect_format(None, &webp, ""), "jpg");
    }

    #[test]
    fn content_type_with_charset_is_handled() {
        assert_eq!(detect_format(Some("image/jpeg; charset=utf-8"), b"", ""), "jpg");
    }

    #[test]
    fn alicdn_urls_get_sibling_hosts() {
        let urls = alternative_urls("https://gd1.alicdn.com/pic/item.jpg");
        assert_eq!(urls[0], "https://gd1.alicdn.com/pic/item.jpg");
        assert!(urls.contains(&"https://img.alicdn.com/pic/item.jpg".to_string()));
        assert!(urls.contains(&"https://gw.alicdn.com/pic/item.jpg".to_string()));
        assert!(urls.len() > 1);
    }

    #[test]
    fn non_alicdn_urls_have_no_alternatives() {
        let urls = alternative_urls("https://img.pddpic.com/pic/item.jpg");
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn invalid_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = ImageDownloader::new(
            crate::http::build_client(Duration::from_secs(1)),
            dir.path().to_path_buf(),
        )
        .unwrap();

        let result = downloader.download("ftp://example.com/a.jpg").await;
        assert!(matches!(result, Err(ApiError::BusinessRule(_))));
    }

    #[test]
    fn purge_clears_registered_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let _downloader = ImageDownloader::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
        )
        .unwrap();

        std::fs::write(dir.path().join("a.jpg"), b"data").unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"data").unwrap();

        assert!(purge_temp_dirs() >= 2);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
