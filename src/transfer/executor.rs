//! Authenticated streaming fetch into a destination file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::COOKIE;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::TransferError;
use super::progress::{CHUNK_SIZE, ProgressSample, ProgressSampler};
use crate::auth::Credential;
use crate::user_agent;

/// Default connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout between body reads.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Where the content was written.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes_downloaded: u64,
    /// Final size; equals `bytes_downloaded` when the server sent no length.
    pub bytes_total: u64,
}

/// Performs GET requests and streams bodies to disk.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    client: Client,
}

impl TransferExecutor {
    /// Builds an executor with the given connect and read timeouts.
    /// Redirects are followed and gzip bodies are decoded.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientBuild`] if the TLS backend or system
    /// configuration prevents building a client.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_transfer_user_agent())
            .build()
            .map_err(TransferError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Wraps a preconfigured client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetches `url` into `destination`.
    ///
    /// A non-empty `credential` is sent as the `Cookie` header. Any
    /// non-success status fails the transfer before the destination is
    /// created. The destination is created fresh, its parent directories on
    /// demand. Samples go to `progress`: one at 0% once the body starts, then
    /// one per integer percent change.
    ///
    /// On every failure path, including `cancel` firing and the future being
    /// dropped, a partially written destination is removed.
    ///
    /// # Errors
    ///
    /// Returns the [`TransferError`] that ended the transfer.
    #[instrument(
        skip(self, credential, progress, cancel),
        fields(download_id = id, url = %url, path = %destination.display())
    )]
    pub async fn execute(
        &self,
        id: u64,
        url: &str,
        destination: &Path,
        credential: &Credential,
        progress: &UnboundedSender<ProgressSample>,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if !credential.is_empty() {
            request = request.header(COOKIE, credential.as_str());
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransferError::cancelled(url)),
            sent = request.send() => sent.map_err(|e| TransferError::from_reqwest(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "server rejected download");
            return Err(TransferError::http_status(url, status.as_u16()));
        }
        let content_length = response.content_length().unwrap_or(0);
        debug!(content_length, "response accepted");

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        let file = File::create(destination)
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        let mut guard = PartialFileGuard::new(destination);
        let mut writer = BufWriter::new(file);

        let mut sampler = ProgressSampler::new(content_length);
        let _ = progress.send(sampler.start());

        let sink = BodySink {
            url,
            path: destination,
            progress,
            cancel,
        };
        let written = stream_body(response.bytes_stream(), &mut writer, &mut sampler, &sink, |e| {
            TransferError::from_reqwest(url, e)
        })
        .await?;

        writer
            .flush()
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        drop(writer);
        guard.disarm();

        let bytes_total = if sampler.total() == 0 {
            written
        } else {
            sampler.total()
        };
        info!(bytes = written, "download complete");
        Ok(TransferOutcome {
            path: destination.to_path_buf(),
            bytes_downloaded: written,
            bytes_total,
        })
    }
}

/// Where body bytes and samples go.
pub(crate) struct BodySink<'a> {
    pub(crate) url: &'a str,
    pub(crate) path: &'a Path,
    pub(crate) progress: &'a UnboundedSender<ProgressSample>,
    pub(crate) cancel: &'a CancellationToken,
}

/// Copies `body` into `writer` in slices of at most [`CHUNK_SIZE`] bytes,
/// sampling after every slice. Returns the number of bytes written.
pub(crate) async fn stream_body<S, B, E, W, F>(
    mut body: S,
    writer: &mut W,
    sampler: &mut ProgressSampler,
    sink: &BodySink<'_>,
    map_err: F,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    W: AsyncWrite + Unpin,
    F: Fn(E) -> TransferError,
{
    let mut written: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = sink.cancel.cancelled() => return Err(TransferError::cancelled(sink.url)),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(&map_err)?;
        for slice in chunk.as_ref().chunks(CHUNK_SIZE) {
            writer
                .write_all(slice)
                .await
                .map_err(|e| TransferError::io(sink.path, e))?;
            written += slice.len() as u64;
            if let Some(sample) = sampler.observe(written) {
                let _ = sink.progress.send(sample);
            }
        }
    }
    Ok(written)
}

/// Removes the destination on drop unless disarmed.
struct PartialFileGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialFileGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFileGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial file"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use futures_util::stream;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn executor() -> TransferExecutor {
        TransferExecutor::new(CONNECT_TIMEOUT, READ_TIMEOUT).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressSample>) -> Vec<ProgressSample> {
        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }
        samples
    }

    #[tokio::test]
    async fn test_stream_body_four_chunks_report_quarters() {
        let body = stream::iter((0..4).map(|_| Ok::<_, std::io::Error>(vec![7_u8; 250])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = BodySink {
            url: "https://x/f",
            path: Path::new("/dev/null"),
            progress: &tx,
            cancel: &cancel,
        };
        let mut sampler = ProgressSampler::new(1000);
        let mut out = Vec::new();

        let written = stream_body(body, &mut out, &mut sampler, &sink, |e| {
            TransferError::io("/dev/null", e)
        })
        .await
        .unwrap();

        assert_eq!(written, 1000);
        assert_eq!(out.len(), 1000);
        let percents: Vec<u8> = drain(&mut rx).iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_stream_body_splits_large_chunks() {
        let body = stream::iter([Ok::<_, std::io::Error>(vec![1_u8; 10 * CHUNK_SIZE])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = BodySink {
            url: "u",
            path: Path::new("p"),
            progress: &tx,
            cancel: &cancel,
        };
        let mut sampler = ProgressSampler::new(10 * CHUNK_SIZE as u64);

        stream_body(body, &mut Vec::<u8>::new(), &mut sampler, &sink, |e| {
            TransferError::io("p", e)
        })
        .await
        .unwrap();

        let percents: Vec<u8> = drain(&mut rx).iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[tokio::test]
    async fn test_stream_body_error_mid_stream_is_reported() {
        let body = stream::iter([
            Ok(vec![0_u8; 100]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = BodySink {
            url: "u",
            path: Path::new("p"),
            progress: &tx,
            cancel: &cancel,
        };

        let mut sampler = ProgressSampler::new(0);
        let result = stream_body(body, &mut Vec::<u8>::new(), &mut sampler, &sink, |e| {
            TransferError::io("p", e)
        })
        .await;

        assert!(matches!(result, Err(TransferError::Io { .. })));
    }

    #[tokio::test]
    async fn test_stream_body_cancel_unblocks_pending_read() {
        let body =
            stream::iter([Ok::<_, std::io::Error>(vec![0_u8; 10])]).chain(stream::pending());
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = BodySink {
            url: "u",
            path: Path::new("p"),
            progress: &tx,
            cancel: &cancel,
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut sampler = ProgressSampler::new(0);
        let mut out = Vec::<u8>::new();
        let result = stream_body(Box::pin(body), &mut out, &mut sampler, &sink, |e| {
            TransferError::io("p", e)
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_partial_file_guard_removes_unless_disarmed() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.bin");
        let dropped = dir.path().join("dropped.bin");
        std::fs::write(&kept, b"x").unwrap();
        std::fs::write(&dropped, b"x").unwrap();

        {
            let mut guard = PartialFileGuard::new(&kept);
            guard.disarm();
            let _other = PartialFileGuard::new(&dropped);
        }

        assert!(kept.exists());
        assert!(!dropped.exists());
    }

    #[tokio::test]
    async fn test_execute_writes_file_and_reports_progress() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5_u8; 1000]))
            .mount(&server)
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let destination = dir.path().join("nested").join("file.bin");

        let outcome = executor()
            .execute(
                1,
                &format!("{}/file.bin", server.uri()),
                &destination,
                &Credential::empty(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes_downloaded, 1000);
        assert_eq!(outcome.bytes_total, 1000);
        assert_eq!(std::fs::read(&destination).unwrap().len(), 1000);
        let samples = drain(&mut rx);
        assert_eq!(samples.first().map(|s| s.percent), Some(0));
        assert_eq!(samples.last().map(|s| s.percent), Some(100));
        assert!(samples.windows(2).all(|w| w[0].percent < w[1].percent));
    }

    #[tokio::test]
    async fn test_execute_sends_cookie_header_when_credential_present() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("cookie", "BDUSS=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"secret".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = executor()
            .execute(
                2,
                &format!("{}/private", server.uri()),
                &dir.path().join("private"),
                &Credential::from_header("BDUSS=abc"),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes_downloaded, 6);
    }

    #[tokio::test]
    async fn test_execute_follows_redirects() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/share/1"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/cdn/1", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let destination = dir.path().join("one.txt");

        executor()
            .execute(
                3,
                &format!("{}/share/1", server.uri()),
                &destination,
                &Credential::empty(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_execute_404_creates_no_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let destination = dir.path().join("missing.zip");

        let result = executor()
            .execute(
                4,
                &format!("{}/missing.zip", server.uri()),
                &destination,
                &Credential::empty(),
                &tx,
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(TransferError::HttpStatus { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected HttpStatus, got {other:?}"),
        }
        assert!(!destination.exists());
        assert!(drain(&mut rx).is_empty(), "no progress before the body starts");
    }

    #[tokio::test]
    async fn test_execute_cancel_before_response_leaves_nothing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0_u8; 64])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let destination = dir.path().join("slow.bin");

        let result = executor()
            .execute(
                5,
                &format!("{}/slow.bin", server.uri()),
                &destination,
                &Credential::empty(),
                &tx,
                &cancel,
            )
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(!destination.exists());
    }

    #[test]
    fn test_execute_invalid_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let executor = executor();
        let cancel = CancellationToken::new();
        let result = tokio_test::block_on(executor.execute(
            6,
            "not a url",
            Path::new("/tmp/never"),
            &Credential::empty(),
            &tx,
            &cancel,
        ));
        assert!(matches!(result, Err(TransferError::InvalidUrl { .. })));
    }
}
