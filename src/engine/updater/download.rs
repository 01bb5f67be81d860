//! Secure Fetcher
//!
//! Minimal HTTP/1.1 GET over TLS to the static distribution host. The body is
//! streamed straight to disk until the server closes the connection;
//! `Content-Length` is not relied on.
//!
//! Two retry layers:
//! - a single socket read that fails under allocation pressure is retried in
//!   place (`max_chunk_retries`, no delay); read timeouts are not, they fail
//!   the attempt
//! - a whole file transfer is retried from scratch (`max_file_retries`,
//!   `backoff` between attempts)

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::layout::remove_file_if_exists;
use crate::engine::device::DeviceControl;

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to send request: {0}")]
    Request(#[source] io::Error),
    #[error("Socket read failed after {retries} retries: {source}")]
    Read {
        retries: u32,
        #[source]
        source: io::Error,
    },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Response headers exceed {0} bytes")]
    HeaderTooLarge(usize),
    #[error("Server answered HTTP {0}")]
    Status(u16),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Giving up on {remote_path} after {attempts} attempts: {last}")]
    Exhausted {
        remote_path: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

/// Retry parameters for both layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_file_retries: u32,
    pub max_chunk_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_file_retries: 5,
            max_chunk_retries: 10,
            retry_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Same attempt counts, no waiting between file attempts
    pub fn immediate() -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// A connected byte stream to the distribution host
pub trait Transport: Read + Write {}

impl<T: Read + Write> Transport for T {}

/// Opens the encrypted connection a single file is fetched over
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>>;
}

/// rustls client with the webpki root set
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TlsConnector {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, FetchError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| FetchError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            connect_timeout,
            read_timeout,
        })
    }
}

impl Connector for TlsConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        tcp.set_read_timeout(Some(self.read_timeout))?;
        tcp.set_write_timeout(Some(self.read_timeout))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let conn = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(io::Error::other)?;

        Ok(Box::new(StreamOwned::new(conn, tcp)))
    }
}

/// Host, port and path prefix split out of the distribution base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    pub host: String,
    pub port: u16,
    pub prefix: String,
}

impl BaseUrl {
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let rest = url
            .strip_prefix("https://")
            .ok_or_else(|| FetchError::InvalidUrl(format!("{} (https required)", url)))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| FetchError::InvalidUrl(format!("{} (bad port)", url)))?;
                (host, port)
            }
            None => (authority, 443),
        };
        if host.is_empty() {
            return Err(FetchError::InvalidUrl(format!("{} (missing host)", url)));
        }

        let mut prefix = path.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        Ok(Self {
            host: host.to_string(),
            port,
            prefix,
        })
    }

    pub fn request_path(&self, remote_path: &str) -> String {
        format!("{}{}?raw=True", self.prefix, remote_path.trim_start_matches('/'))
    }
}

/// Downloads single files from the distribution host
pub struct Fetcher {
    connector: Box<dyn Connector>,
    base: BaseUrl,
    policy: RetryPolicy,
    chunk_size: usize,
    max_header_bytes: usize,
    device: Arc<dyn DeviceControl>,
}

impl Fetcher {
    pub fn new(
        connector: Box<dyn Connector>,
        base: BaseUrl,
        policy: RetryPolicy,
        device: Arc<dyn DeviceControl>,
    ) -> Self {
        Self {
            connector,
            base,
            policy,
            chunk_size: 1024,
            max_header_bytes: 8 * 1024,
            device,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self
    }

    /// Fetch one file, retrying the whole transfer per the file policy.
    ///
    /// On error the destination may hold a partial body.
    pub fn fetch_retrying(&self, remote_path: &str, dest: &Path) -> Result<u64, FetchError> {
        let attempts = self.policy.max_file_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch(remote_path, dest) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Fetch of {} failed (attempt {}/{}): {}",
                        remote_path, attempt, attempts, e
                    );
                    if !self.policy.retry_backoff.is_zero() {
                        debug!("Retrying in {:?}", self.policy.retry_backoff);
                        thread::sleep(self.policy.retry_backoff);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FetchError::Exhausted {
                        remote_path: remote_path.to_string(),
                        attempts,
                        last: Box::new(e),
                    })
                }
            }
        }
    }

    /// Single transfer attempt. Returns the number of body bytes written.
    pub fn fetch(&self, remote_path: &str, dest: &Path) -> Result<u64, FetchError> {
        self.device.reclaim_memory();
        info!("Downloading https://{}{}", self.base.host, self.base.request_path(remote_path));

        let result = self.transfer(remote_path, dest);

        self.device.reclaim_memory();
        result
    }

    fn transfer(&self, remote_path: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut stream = self
            .connector
            .connect(&self.base.host, self.base.port)
            .map_err(|source| FetchError::Connect {
                host: self.base.host.clone(),
                source,
            })?;

        let result = self.exchange(stream.as_mut(), remote_path, dest);

        self.device.reclaim_memory();
        drop(stream);
        result
    }

    fn exchange(
        &self,
        stream: &mut dyn Transport,
        remote_path: &str,
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.base.request_path(remote_path),
            self.base.host
        );
        stream
            .write_all(request.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(FetchError::Request)?;

        let mut buffer = vec![0u8; self.chunk_size];
        let body_start = self.read_head(stream, &mut buffer)?;

        let write_err = |source: io::Error| FetchError::Write {
            path: dest.to_path_buf(),
            source,
        };
        remove_file_if_exists(dest).map_err(write_err)?;
        let mut file = File::create(dest).map_err(write_err)?;
        file.write_all(&body_start).map_err(write_err)?;
        let mut written = body_start.len() as u64;
        drop(body_start);

        loop {
            let n = self.read_chunk(stream, &mut buffer)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).map_err(write_err)?;
            written += n as u64;
            trace!("{}: {} bytes", remote_path, written);
        }
        file.flush().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        debug!("Wrote {} bytes to {}", written, dest.display());
        Ok(written)
    }

    /// Consume the status line and headers; returns body bytes read past them
    fn read_head(&self, stream: &mut dyn Transport, buffer: &mut [u8]) -> Result<Vec<u8>, FetchError> {
        let mut head: Vec<u8> = Vec::new();
        let split = loop {
            if let Some(pos) = find_delimiter(&head) {
                break pos;
            }
            if head.len() > self.max_header_bytes {
                return Err(FetchError::HeaderTooLarge(self.max_header_bytes));
            }
            let n = self.read_chunk(stream, buffer)?;
            if n == 0 {
                return Err(FetchError::MalformedResponse(
                    "connection closed before end of headers".to_string(),
                ));
            }
            head.extend_from_slice(&buffer[..n]);
        };

        let status = parse_status(&head[..split])?;
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status));
        }
        Ok(head.split_off(split + HEADER_DELIMITER.len()))
    }

    /// One socket read with in-place retry of transient failures.
    ///
    /// A zero-length read is a clean end of stream. A peer that closes without
    /// a TLS close_notify is treated the same way; truncation is caught by
    /// checksum validation, not here.
    fn read_chunk(&self, stream: &mut dyn Transport, buffer: &mut [u8]) -> Result<usize, FetchError> {
        let mut retries = 0;
        loop {
            match stream.read(buffer) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Connection closed without close_notify");
                    return Ok(0);
                }
                Err(e) if is_transient(&e) && retries < self.policy.max_chunk_retries => {
                    retries += 1;
                    trace!("Transient read failure ({}/{}): {}", retries, self.policy.max_chunk_retries, e);
                }
                Err(source) => return Err(FetchError::Read { retries, source }),
            }
        }
    }
}

/// A socket read timeout surfaces as `WouldBlock` or `TimedOut` and is not transient
fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::OutOfMemory | io::ErrorKind::Interrupted)
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEADER_DELIMITER.len())
        .position(|w| w == HEADER_DELIMITER)
}

fn parse_status(head: &[u8]) -> Result<u16, FetchError> {
    let line_end = head.iter().position(|&b| b == b'\r').unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| FetchError::MalformedResponse("status line is not UTF-8".to_string()))?;
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| FetchError::MalformedResponse(format!("bad status line: {}", line))),
        _ => Err(FetchError::MalformedResponse(format!("bad status line: {}", line))),
    }
}
