//! # Artifact Downloader
//!
//! Fetches a remote artifact into the local model cache. The body is streamed
//! into a private temporary file next to the destination and published with a
//! single atomic rename, so concurrent readers only ever see complete files.
//!
//! ## Failure Classification:
//! - **transient**: connection errors, timeouts, body read errors
//! - **permanent**: malformed URLs, non-2xx status codes, local filesystem errors
//!   (including writes to the temp file)
//!
//! There is no retry loop here; a failed fetch is reported immediately.
//!
//! The blocking client owns a private runtime and must not be built on an
//! async worker, so it is created on the first `fetch`, which always runs on
//! a blocking thread.

use reqwest::blocking::Client;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("speech-gateway/", env!("CARGO_PKG_VERSION"));

/// Error returned by `Downloader::fetch`.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to download {url}: {message}")]
pub struct FetchError {
    pub url: String,
    pub message: String,
    /// Network-level failure that might succeed if attempted again later.
    pub transient: bool,
}

impl FetchError {
    fn transient(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            message: message.into(),
            transient: true,
        }
    }

    fn permanent(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            message: message.into(),
            transient: false,
        }
    }
}

/// Blocking HTTP downloader with a bounded per-request timeout.
#[derive(Debug, Clone)]
pub struct Downloader {
    timeout: Duration,
    client: OnceLock<Client>,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self, url: &str) -> Result<&Client, FetchError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::permanent(url, format!("cannot build http client: {}", e)))?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Download `url` to `destination`, returning the number of bytes written.
    pub fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| FetchError::permanent(url, format!("invalid url: {}", e)))?;

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| FetchError::permanent(url, format!("cannot create {}: {}", parent.display(), e)))?;

        info!(url = %url, destination = %destination.display(), "Downloading artifact");
        let started = Instant::now();

        let mut response = self
            .client(url)?
            .get(parsed)
            .send()
            .map_err(|e| classify_request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::permanent(url, format!("HTTP {}", status)));
        }

        // The temp file lives in the destination directory so the final rename
        // never crosses a filesystem boundary. Dropping it on an error path
        // removes the partial file.
        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent)
            .map_err(|e| FetchError::permanent(url, format!("cannot create temp file: {}", e)))?;

        let written = copy_body(&mut response, tmp.as_file_mut()).map_err(|e| e.into_fetch_error(url))?;

        tmp.as_file_mut()
            .sync_all()
            .map_err(|e| FetchError::permanent(url, format!("cannot flush temp file: {}", e)))?;

        tmp.persist(destination).map_err(|e| {
            FetchError::permanent(
                url,
                format!("cannot publish {}: {}", destination.display(), e.error),
            )
        })?;

        info!(
            url = %url,
            bytes = written,
            elapsed_ms = %started.elapsed().as_millis(),
            "Artifact downloaded"
        );
        Ok(written)
    }
}

/// Which side of the copy failed.
#[derive(Debug)]
enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

impl CopyError {
    fn into_fetch_error(self, url: &str) -> FetchError {
        match self {
            CopyError::Read(e) => FetchError::transient(url, format!("error reading response body: {}", e)),
            CopyError::Write(e) => FetchError::permanent(url, format!("cannot write temp file: {}", e)),
        }
    }
}

fn copy_body<R: io::Read, W: Write>(body: &mut R, sink: &mut W) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        sink.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
    sink.flush().map_err(CopyError::Write)?;
    debug!(bytes = total, "Response body copied");
    Ok(total)
}

fn classify_request_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::permanent(url, err.to_string())
    } else {
        FetchError::transient(url, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn downloader() -> Downloader {
        Downloader::new(Duration::from_secs(10))
    }

    #[test]
    fn test_fetch_publishes_complete_file() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/voices/model.onnx")
            .with_status(200)
            .with_body("onnx-bytes")
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tts").join("voice.onnx");
        let url = format!("{}/voices/model.onnx", server.url());

        let written = downloader().fetch(&url, &dest).unwrap();

        mock.assert();
        assert_eq!(written, 10);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "onnx-bytes");
        // Only the published file remains in the directory.
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_non_success_status_is_permanent() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/missing").with_status(404).create();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.onnx");
        let err = downloader()
            .fetch(&format!("{}/missing", server.url()), &dest)
            .unwrap_err();

        assert!(!err.transient);
        assert!(err.message.contains("404"));
        assert!(!dest.exists());
    }

    #[test]
    fn test_invalid_url_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let err = downloader()
            .fetch("not a url", &dir.path().join("x"))
            .unwrap_err();
        assert!(!err.transient);
    }

    #[test]
    fn test_connection_refused_is_transient() {
        // Bind and immediately release a port so nothing is listening on it.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.onnx");

        let err = downloader()
            .fetch(&format!("http://127.0.0.1:{}/model.onnx", port), &dest)
            .unwrap_err();

        assert!(err.transient);
        assert!(!dest.exists());
    }

    /// Reader that yields some bytes and then fails, like a dropped connection.
    struct BrokenBody {
        sent: bool,
    }

    impl Read for BrokenBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
            }
            self.sent = true;
            let chunk = b"partial";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_partial_body_never_reaches_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.onnx");

        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dir.path())
            .unwrap();
        let err = copy_body(&mut BrokenBody { sent: false }, tmp.as_file_mut()).unwrap_err();
        assert!(err.into_fetch_error("http://hub/model.onnx").transient);
        // Error path: the handle is dropped without persisting.
        drop(tmp);

        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Sink that rejects every write, like a full disk.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_local_write_failure_is_permanent() {
        let err = copy_body(&mut &b"onnx-bytes"[..], &mut FullDisk).unwrap_err();
        let err = err.into_fetch_error("http://hub/model.onnx");

        assert!(!err.transient);
        assert!(err.message.contains("no space left"));
    }

    #[actix_web::test]
    async fn test_fetch_from_blocking_pool_inside_server_runtime() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/voices/model.onnx.json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("voice.onnx.json");
        let url = format!("{}/voices/model.onnx.json", server.url());

        // Building and dropping on an async worker must not touch the client.
        let downloader = Downloader::new(Duration::from_secs(10));
        let worker_copy = downloader.clone();
        let written = actix_web::web::block(move || worker_copy.fetch(&url, &dest))
            .await
            .unwrap()
            .unwrap();

        mock.assert_async().await;
        assert_eq!(written, 2);
        drop(downloader);
    }
}
