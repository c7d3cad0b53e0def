//! Shared-Memory Layer - memcached client
//!
//! Speaks the memcache text protocol over a small pool of lazily-opened TCP
//! connections.
//!
//! ```text
//! set <key> <flags> <exptime> <bytes>\r\n<data>\r\n   ->  STORED\r\n
//! get <key>\r\n                                      ->  VALUE <key> <flags> <bytes>\r\n<data>\r\nEND\r\n
//!                                                    or  END\r\n
//! version\r\n                                        ->  VERSION <version>\r\n
//! ```
//!
//! TTL is enforced by the server (`exptime`). The operation timeout covers
//! the whole call: waiting for a pool slot, connecting, and the round-trip.
//! A connection that saw any failure is closed instead of returned to the
//! pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use super::clock::SharedClock;
use super::entry::CacheEntry;
use super::layer::{validate_ttl, CacheLayer};
use crate::error::{Error, Result};

/// Longest key memcached accepts
pub const MAX_KEY_LEN: usize = 250;

/// memcached's default item size limit (1 MiB)
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Default number of concurrent connections
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Expiry values above this are read by memcached as absolute Unix times
const RELATIVE_EXPTIME_LIMIT: u64 = 30 * 24 * 60 * 60;

const LAYER_NAME: &str = "memcache";

/// memcached layer configuration
#[derive(Debug, Clone)]
pub struct MemcacheConfig {
    /// Server address (`host:port`)
    pub addr: String,
    /// Entry time-to-live
    pub ttl: Duration,
    /// Bound on a whole operation, including the wait for a connection
    pub op_timeout: Duration,
    /// Maximum open connections
    pub pool_size: usize,
    /// Largest value accepted from the server
    pub max_item_size: usize,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11211".to_string(),
            ttl: Duration::from_secs(50),
            op_timeout: Duration::from_millis(500),
            pool_size: DEFAULT_POOL_SIZE,
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
        }
    }
}

type Connection = BufReader<TcpStream>;

/// Connection checked out of the pool. Dropping it closes the socket.
struct Lease<'a> {
    layer: &'a MemcacheLayer,
    conn: Connection,
    _permit: SemaphorePermit<'a>,
}

impl Lease<'_> {
    /// Hand a healthy connection back to the pool
    fn release(self) {
        self.layer.idle.lock().push(self.conn);
    }
}

/// memcached-backed cache layer
pub struct MemcacheLayer {
    config: MemcacheConfig,
    /// Idle connections ready for reuse
    idle: Mutex<Vec<Connection>>,
    /// One permit per connection slot
    slots: Semaphore,
    clock: SharedClock,
}

impl MemcacheLayer {
    /// Create a new layer. Does not connect until first use.
    pub fn new(config: MemcacheConfig, clock: SharedClock) -> Result<Self> {
        validate_ttl(LAYER_NAME, config.ttl)?;
        if config.pool_size == 0 {
            return Err(Error::Config(
                "memcache pool size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            idle: Mutex::new(Vec::with_capacity(config.pool_size)),
            slots: Semaphore::new(config.pool_size),
            config,
            clock,
        })
    }

    /// Server address
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Wait for a slot and take an idle connection or open a new one
    async fn checkout(&self) -> Result<Lease<'_>> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::layer(LAYER_NAME, "connection pool closed"))?;

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let stream = TcpStream::connect(&self.config.addr).await?;
                stream.set_nodelay(true)?;
                debug!(addr = %self.config.addr, "connected to memcached");
                BufReader::new(stream)
            }
        };

        Ok(Lease {
            layer: self,
            conn,
            _permit: permit,
        })
    }

    /// Run `op` under the operation timeout
    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.op_timeout, op)
            .await
            .map_err(|_| Error::layer(LAYER_NAME, "operation timed out"))?
    }

    /// Fetch the raw stored value
    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        self.bounded(async {
            let mut lease = self.checkout().await?;
            write_get(lease.conn.get_mut(), key).await?;
            let value = read_get_response(&mut lease.conn, self.config.max_item_size).await?;
            lease.release();
            Ok(value)
        })
        .await
    }

    /// Store a raw value with a relative TTL
    async fn set_raw(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let exptime = self.exptime(ttl);
        self.bounded(async {
            let mut lease = self.checkout().await?;
            write_set(lease.conn.get_mut(), key, value, exptime).await?;
            read_set_response(&mut lease.conn).await?;
            lease.release();
            Ok(())
        })
        .await
    }

    /// Check that the server answers `version`
    pub async fn is_available(&self) -> bool {
        let check = self.bounded(async {
            let mut lease = self.checkout().await?;
            lease.conn.get_mut().write_all(b"version\r\n").await?;
            let line = read_line(&mut lease.conn).await?;
            if !line.starts_with("VERSION") {
                return Err(server_error(&line));
            }
            lease.release();
            Ok(())
        });
        check.await.is_ok()
    }

    /// memcached reads large expiry values as absolute timestamps
    fn exptime(&self, ttl: Duration) -> u64 {
        let secs = ttl.as_secs();
        if secs > RELATIVE_EXPTIME_LIMIT {
            self.clock.now().timestamp().max(0) as u64 + secs
        } else {
            secs
        }
    }
}

/// memcached text-protocol key rules
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

async fn write_get<W: AsyncWrite + Unpin>(w: &mut W, key: &str) -> Result<()> {
    let mut buf = Vec::with_capacity(key.len() + 6);
    buf.extend_from_slice(b"get ");
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(b"\r\n");
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

async fn write_set<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &str,
    value: &[u8],
    exptime: u64,
) -> Result<()> {
    let header = format!("set {} 0 {} {}\r\n", key, exptime, value.len());
    let mut buf = Vec::with_capacity(header.len() + value.len() + 2);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one CRLF-terminated line, without the terminator
async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(Error::layer(LAYER_NAME, "connection closed by server"));
    }
    if !line.ends_with(b"\r\n") {
        return Err(Error::layer(LAYER_NAME, "response line not CRLF terminated"));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| Error::layer(LAYER_NAME, "response line is not UTF-8"))
}

fn server_error(line: &str) -> Error {
    Error::layer(LAYER_NAME, format!("unexpected response: {line}"))
}

async fn read_get_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    max_item_size: usize,
) -> Result<Option<Bytes>> {
    let line = read_line(r).await?;
    if line == "END" {
        return Ok(None);
    }

    // VALUE <key> <flags> <bytes> [<cas unique>]
    let mut parts = line.split(' ');
    if parts.next() != Some("VALUE") {
        return Err(server_error(&line));
    }
    let len: usize = parts
        .nth(2)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| server_error(&line))?;

    if len > max_item_size {
        return Err(Error::layer(
            LAYER_NAME,
            format!("value of {len} bytes exceeds limit of {max_item_size}"),
        ));
    }
    let block = len
        .checked_add(2)
        .ok_or_else(|| server_error(&line))?;

    let mut data = vec![0u8; block];
    r.read_exact(&mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(Error::layer(LAYER_NAME, "value block not CRLF terminated"));
    }
    data.truncate(len);

    let end = read_line(r).await?;
    if end != "END" {
        return Err(server_error(&end));
    }

    Ok(Some(Bytes::from(data)))
}

async fn read_set_response<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<()> {
    let line = read_line(r).await?;
    if line == "STORED" {
        Ok(())
    } else {
        Err(server_error(&line))
    }
}

impl std::fmt::Debug for MemcacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheLayer for MemcacheLayer {
    fn name(&self) -> &str {
        LAYER_NAME
    }

    fn ttl(&self) -> Duration {
        self.config.ttl
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        if !is_valid_key(key) {
            debug!(key, "key not representable in memcached");
            return None;
        }

        let raw = match self.get_raw(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "memcached GET failed");
                return None;
            }
        };

        match CacheEntry::decode(&raw) {
            Ok(entry) if entry.is_expired(self.config.ttl, self.clock.now()) => None,
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable memcached value");
                None
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        if !is_valid_key(key) {
            return Err(Error::layer(
                LAYER_NAME,
                format!("key '{key}' is not a valid memcached key"),
            ));
        }
        let raw = entry.encode().map_err(|e| Error::layer(LAYER_NAME, e))?;
        self.set_raw(key, &raw, self.config.ttl).await
    }

    async fn is_ready(&self) -> bool {
        self.is_available().await
    }
}

// =============================================================================
// Tests
// =============================================================================
