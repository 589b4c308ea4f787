use crate::core::events::CancelToken;
use crate::error::{Result, UpdateError};
use reqwest::header::CONTENT_LENGTH;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, Span};

/// Size of the buffer used to stream a remote body to disk.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Response body being streamed from a remote server.
pub struct RemoteBody {
    /// Length announced by the server, if any.
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Remote access used by the downloader and the build feeds.
pub trait Transport: Send + Sync {
    /// Server-reported length of `url` without fetching the body (0 when not announced).
    fn content_length(&self, url: &str) -> Result<u64>;

    /// Starts a GET of `url` and hands back the body stream.
    fn open(&self, url: &str) -> Result<RemoteBody>;

    /// Fetches `url` and returns the body as text.
    fn fetch_text(&self, url: &str) -> Result<String>;
}

/// [`Transport`] backed by a blocking reqwest client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// `request_timeout` bounds connecting and the metadata/page requests. Streaming a
    /// body has no overall deadline so large archives are not cut off.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(request_timeout)
            .timeout(None::<Duration>)
            .build()?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn check_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(UpdateError::network(url, format!("server returned {status}")))
        }
    }
}

impl Transport for HttpTransport {
    fn content_length(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .map_err(|e| UpdateError::network(url, e.to_string()))?;
        Self::check_status(url, response.status())?;

        // HEAD responses carry no body, so read the header rather than the body length.
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0))
    }

    fn open(&self, url: &str) -> Result<RemoteBody> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| UpdateError::network(url, e.to_string()))?;
        Self::check_status(url, response.status())?;

        Ok(RemoteBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .map_err(|e| UpdateError::network(url, e.to_string()))?;
        Self::check_status(url, response.status())?;

        response
            .text()
            .map_err(|e| UpdateError::network(url, e.to_string()))
    }
}

/// Byte counters for the transfer in flight, readable from any thread.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    total_bytes: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl DownloadProgress {
    /// Total size of the current transfer, 0 when unknown.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Completed fraction in `0.0..=1.0`, or `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes() {
            0 => None,
            total => Some((self.bytes_transferred() as f64 / total as f64).min(1.0)),
        }
    }

    fn start(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);
    }

    fn advance(&self, bytes: usize) {
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn settle(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }
}

/// Streams remote files to disk. One transfer at a time per instance.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    progress: Arc<DownloadProgress>,
    abort: CancelToken,
    span: Span,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            progress: Arc::new(DownloadProgress::default()),
            abort: CancelToken::new(),
            span: info_span!("downloader"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shared handle to the progress counters of this downloader.
    pub fn progress(&self) -> Arc<DownloadProgress> {
        Arc::clone(&self.progress)
    }

    pub fn query_remote_size(&self, url: &str) -> Result<u64> {
        let _guard = self.span.enter();
        self.transport.content_length(url)
    }

    /// Downloads `url` to `destination`, replacing any existing file.
    ///
    /// The parent directory must already exist. Returns the number of bytes on disk.
    /// On error the partial file is left for the caller; only [`Downloader::stop`]
    /// deletes it. A stop requested before the call fails it without any request.
    pub fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        let _guard = self.span.enter();

        if self.abort.is_cancelled() {
            return Err(UpdateError::Aborted {
                url: url.to_string(),
            });
        }

        let download_error = |message: String| UpdateError::Download {
            url: url.to_string(),
            message,
        };

        let body = self
            .transport
            .open(url)
            .map_err(|e| download_error(e.to_string()))?;
        self.progress.start(body.content_length.unwrap_or(0));

        let mut reader = body.reader;
        let mut file = File::create(destination)
            .map_err(|e| download_error(format!("{}: {e}", destination.display())))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            if self.abort.is_cancelled() {
                drop(file);
                drop(reader);
                self.discard_partial(destination);
                return Err(UpdateError::Aborted {
                    url: url.to_string(),
                });
            }

            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(download_error(e.to_string())),
            };

            file.write_all(&buffer[..read])
                .map_err(|e| download_error(format!("{}: {e}", destination.display())))?;
            self.progress.advance(read);
        }

        file.flush()
            .map_err(|e| download_error(format!("{}: {e}", destination.display())))?;
        let written = file
            .metadata()
            .map_err(|e| download_error(format!("{}: {e}", destination.display())))?
            .len();
        self.progress.settle(written);

        if let Some(expected) = body.content_length {
            if written != expected {
                return Err(download_error(format!(
                    "truncated transfer: received {written} of {expected} bytes"
                )));
            }
        }

        info!("Download of {} completed successfully ({} bytes)", url, written);
        Ok(written)
    }

    /// Aborts the transfer in flight. The running `download` closes its streams,
    /// deletes the partial destination file and returns [`UpdateError::Aborted`].
    pub fn stop(&self) {
        self.abort.cancel();
    }

    /// Clears an earlier [`Downloader::stop`] so the next transfer may run.
    pub fn reset(&self) {
        self.abort.reset();
    }

    fn discard_partial(&self, destination: &Path) {
        if let Err(e) = std::fs::remove_file(destination) {
            if e.kind() != ErrorKind::NotFound {
                error!(
                    "Unable to delete incomplete file {}. {}",
                    destination.display(),
                    e
                );
            }
        }
    }
}
