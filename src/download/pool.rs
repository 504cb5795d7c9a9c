//! Reusable client instances shared across workers.
//!
//! Clients carry warm connection state (the HTTP side keeps a keep-alive
//! pool, and building one is not free), so instead of constructing one
//! per request the engine checks them in and out of bounded free lists.
//! Releasing into a full pool drops the client.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::client::HttpClient;
use super::ftp::FtpClient;

/// Default bound for each free list.
const DEFAULT_POOL_SIZE: usize = 16;

/// Bounded free lists of HTTP and FTP clients.
#[derive(Debug)]
pub struct ConnectionPool {
    http: Mutex<Vec<Arc<HttpClient>>>,
    ftp: Mutex<Vec<Arc<FtpClient>>>,
    max_size: usize,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl ConnectionPool {
    /// Creates a pool bounding each free list at `max_size`.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            http: Mutex::new(Vec::new()),
            ftp: Mutex::new(Vec::new()),
            max_size: max_size.max(1),
        }
    }

    /// Checks out an HTTP client, creating one when the pool is empty.
    #[must_use]
    pub fn acquire_http(&self) -> Arc<HttpClient> {
        let mut pool = lock(&self.http);
        pool.pop().unwrap_or_else(|| {
            debug!("http pool empty, creating client");
            Arc::new(HttpClient::new())
        })
    }

    /// Returns an HTTP client to the pool; dropped when the pool is full.
    pub fn release_http(&self, client: Arc<HttpClient>) {
        let mut pool = lock(&self.http);
        if pool.len() < self.max_size {
            pool.push(client);
        }
    }

    /// Checks out an FTP client, creating one when the pool is empty.
    #[must_use]
    pub fn acquire_ftp(&self) -> Arc<FtpClient> {
        let mut pool = lock(&self.ftp);
        pool.pop().unwrap_or_else(|| {
            debug!("ftp pool empty, creating client");
            Arc::new(FtpClient::new())
        })
    }

    /// Returns an FTP client to the pool; dropped when the pool is full.
    pub fn release_ftp(&self, client: Arc<FtpClient>) {
        let mut pool = lock(&self.ftp);
        if pool.len() < self.max_size {
            pool.push(client);
        }
    }

    /// Drops every pooled client.
    pub fn clear(&self) {
        lock(&self.http).clear();
        lock(&self.ftp).clear();
        debug!("connection pool cleared");
    }

    /// Number of idle HTTP clients.
    #[must_use]
    pub fn http_idle(&self) -> usize {
        lock(&self.http).len()
    }

    /// Number of idle FTP clients.
    #[must_use]
    pub fn ftp_idle(&self) -> usize {
        lock(&self.ftp).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_from_empty_pool_creates() {
        let pool = ConnectionPool::new(4);
        let client = pool.acquire_http();
        assert_eq!(pool.http_idle(), 0);
        drop(client);
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let pool = ConnectionPool::new(4);
        let client = pool.acquire_http();
        let ptr = Arc::as_ptr(&client);
        pool.release_http(client);
        assert_eq!(pool.http_idle(), 1);

        let again = pool.acquire_http();
        assert_eq!(Arc::as_ptr(&again), ptr);
        assert_eq!(pool.http_idle(), 0);
    }

    #[test]
    fn test_release_over_capacity_drops() {
        let pool = ConnectionPool::new(2);
        for _ in 0..5 {
            pool.release_http(Arc::new(HttpClient::new()));
        }
        assert_eq!(pool.http_idle(), 2);
    }

    #[test]
    fn test_clear_empties_both_lists() {
        let pool = ConnectionPool::new(4);
        pool.release_http(Arc::new(HttpClient::new()));
        pool.release_ftp(Arc::new(FtpClient::new()));
        pool.clear();
        assert_eq!(pool.http_idle(), 0);
        assert_eq!(pool.ftp_idle(), 0);
    }
}
