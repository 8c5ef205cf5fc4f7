use std::{
    future::Future,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{InstallError, format_error_chain};

pub enum FetchError {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for FetchError {
    fn from(e: anyhow::Error) -> Self {
        FetchError::Failed(e)
    }
}

/// Streams `url` into `dest`, returning the number of bytes written.
///
/// Implementations may leave a partial `dest` behind on error; the caller owns cleanup.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send;
}

fn download_chunk_threshold(total_bytes: u64) -> u64 {
    if total_bytes >= 2 * 1024 * 1024 * 1024 {
        8 * 1024 * 1024
    } else if total_bytes >= 512 * 1024 * 1024 {
        4 * 1024 * 1024
    } else {
        1024 * 1024
    }
}

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("simhost/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            // Simulator builds are tens of GiB.
            .timeout(Duration::from_secs(6 * 60 * 60))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            r = self.client.get(url).send() => r,
        };
        let resp = resp
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;

        let expected = resp.content_length();
        let threshold = download_chunk_threshold(expected.unwrap_or(0).max(1));
        let mut f = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;

        let started_at = std::time::Instant::now();
        let mut last_emit_bytes = 0u64;
        let mut last_emit_at = started_at;
        let mut downloaded = 0u64;
        let mut stream = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                c = stream.next() => c,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.context("read body chunk")?;
            f.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", dest.display()))?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);

            let now = std::time::Instant::now();
            if downloaded.saturating_sub(last_emit_bytes) >= threshold
                && now.duration_since(last_emit_at) >= PROGRESS_LOG_INTERVAL
            {
                let elapsed = now.duration_since(started_at).as_secs_f64();
                let speed = if elapsed > 0.0 {
                    (downloaded as f64 / elapsed).round() as u64
                } else {
                    0
                };
                tracing::info!(
                    downloaded_bytes = downloaded,
                    total_bytes = expected.unwrap_or(0),
                    speed_bytes_per_sec = speed,
                    "downloading artifact"
                );
                last_emit_bytes = downloaded;
                last_emit_at = now;
            }
        }

        f.flush().await.ok();
        f.sync_all()
            .await
            .with_context(|| format!("sync {}", dest.display()))?;

        if let Some(expected) = expected
            && downloaded != expected
        {
            return Err(FetchError::Failed(anyhow::anyhow!(
                "truncated body: got {downloaded} of {expected} bytes"
            )));
        }
        Ok(downloaded)
    }
}

/// In-flight downloads go here; the real cache path only ever holds complete files.
pub fn part_path(cache_file: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", cache_file.display()))
}

fn download_backoff(attempt: u32) -> Duration {
    // attempt is 1-based.
    Duration::from_millis(200_u64.saturating_mul(2_u64.pow(attempt.saturating_sub(1).min(10))))
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove partial download");
    }
}

pub async fn download_to_cache<F: Fetch>(
    fetcher: &F,
    url: &str,
    cache_file: &Path,
    attempts: u32,
    sha256: Option<&str>,
    cancel: &CancellationToken,
) -> Result<u64, InstallError> {
    if let Some(parent) = cache_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| InstallError::io(format!("create {}", parent.display()), e))?;
    }

    let part = part_path(cache_file);
    remove_if_exists(&part).await;

    let attempts = attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=attempts {
        tracing::info!(url, attempt, attempts, dest = %cache_file.display(), "fetching artifact");
        let res = match fetcher.fetch(url, &part, cancel).await {
            Ok(bytes) => match sha256 {
                Some(expected) => verify_sha256(&part, expected).await.map(|()| bytes),
                None => Ok(bytes),
            },
            Err(FetchError::Cancelled) => {
                remove_if_exists(&part).await;
                return Err(InstallError::Cancelled { stage: "download" });
            }
            Err(FetchError::Failed(e)) => Err(e),
        };

        match res {
            Ok(bytes) => {
                tokio::fs::rename(&part, cache_file).await.map_err(|e| {
                    InstallError::io(format!("persist {}", cache_file.display()), e)
                })?;
                tracing::info!(bytes, path = %cache_file.display(), "artifact cached");
                return Ok(bytes);
            }
            Err(e) => {
                remove_if_exists(&part).await;
                tracing::warn!(
                    attempt,
                    error = %format_error_chain(&e),
                    "artifact download failed"
                );
                last_err = Some(e);
                if attempt < attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(InstallError::Cancelled { stage: "download" });
                        }
                        _ = tokio::time::sleep(download_backoff(attempt)) => {}
                    }
                }
            }
        }
    }

    let reason = last_err
        .map(|e| format_error_chain(&e))
        .unwrap_or_else(|| "download failed".to_string());
    Err(InstallError::Transfer {
        url: url.to_string(),
        attempts,
        reason,
    })
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    use sha2::Digest;

    let mut f = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub async fn verify_sha256(path: &Path, expected: &str) -> anyhow::Result<()> {
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .context("join checksum worker")?
        .with_context(|| format!("hash {}", path.display()))?;
    if !actual.eq_ignore_ascii_case(expected) {
        anyhow::bail!(
            "sha256 mismatch for {}: expected {expected}, got {actual}",
            path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Serves fixed bytes and counts calls; optionally fails the first N calls.
    #[derive(Clone)]
    pub(crate) struct FakeFetcher {
        pub(crate) body: Arc<Vec<u8>>,
        pub(crate) calls: Arc<AtomicUsize>,
        pub(crate) fail_first: usize,
    }

    impl FakeFetcher {
        pub(crate) fn new(body: Vec<u8>) -> Self {
            Self {
                body: Arc::new(body),
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first: 0,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetch for FakeFetcher {
        async fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            cancel: &CancellationToken,
        ) -> Result<u64, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if n < self.fail_first {
                // Leave a truncated file behind like a dropped connection would.
                std::fs::write(dest, &self.body[..self.body.len() / 2]).unwrap();
                return Err(FetchError::Failed(anyhow::anyhow!("connection reset")));
            }
            std::fs::write(dest, self.body.as_slice()).map_err(anyhow::Error::from)?;
            Ok(self.body.len() as u64)
        }
    }

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn chunk_threshold_scales_with_size() {
        assert_eq!(download_chunk_threshold(1), 1024 * 1024);
        assert_eq!(download_chunk_threshold(600 * 1024 * 1024), 4 * 1024 * 1024);
        assert_eq!(
            download_chunk_threshold(20 * 1024 * 1024 * 1024),
            8 * 1024 * 1024
        );
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(download_backoff(1), Duration::from_millis(200));
        assert_eq!(download_backoff(2), Duration::from_millis(400));
        assert_eq!(download_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn sha256_of_known_input() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("abc");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(sha256_file(&p).unwrap(), ABC_SHA256);
    }

    #[tokio::test]
    async fn download_retries_then_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache").join("carla.tar.gz");
        let mut fetcher = FakeFetcher::new(b"abc".to_vec());
        fetcher.fail_first = 1;

        let bytes = download_to_cache(
            &fetcher,
            "https://example.invalid/carla.tar.gz",
            &cache,
            3,
            Some(ABC_SHA256),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(bytes, 3);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(std::fs::read(&cache).unwrap(), b"abc");
        assert!(!part_path(&cache).exists());
    }

    #[tokio::test]
    async fn exhausted_retries_leave_no_cache_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("carla.tar.gz");
        let mut fetcher = FakeFetcher::new(b"abcdef".to_vec());
        fetcher.fail_first = usize::MAX;

        let err = download_to_cache(
            &fetcher,
            "https://example.invalid/carla.tar.gz",
            &cache,
            2,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, InstallError::Transfer { attempts: 2, .. }));
        assert!(err.to_string().contains("connection reset"));
        assert!(!cache.exists());
        assert!(!part_path(&cache).exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_transfer_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("carla.tar.gz");
        let fetcher = FakeFetcher::new(b"not abc".to_vec());

        let err = download_to_cache(
            &fetcher,
            "https://example.invalid/carla.tar.gz",
            &cache,
            1,
            Some(ABC_SHA256),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("sha256 mismatch"));
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn stale_partial_file_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("carla.tar.gz");
        std::fs::write(part_path(&cache), b"stale partial bytes").unwrap();
        let fetcher = FakeFetcher::new(b"abc".to_vec());

        download_to_cache(
            &fetcher,
            "https://example.invalid/carla.tar.gz",
            &cache,
            1,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&cache).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn cancelled_download_is_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("carla.tar.gz");
        let fetcher = FakeFetcher::new(b"abc".to_vec());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = download_to_cache(
            &fetcher,
            "https://example.invalid/carla.tar.gz",
            &cache,
            3,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled { stage: "download" }));
        assert!(!cache.exists());
    }
}
