//! Idle outbound connections, bucketed by peer address.

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Pool bucket key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
}

impl PoolKey {
    /// Create a key
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug)]
struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

type Bucket = Arc<Mutex<Vec<PooledConnection>>>;

/// Bounded per-peer cache of idle sockets
#[derive(Debug)]
pub struct ConnectionPool {
    buckets: DashMap<PoolKey, Bucket>,
    max_per_peer: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool keeping at most `max_per_peer` idle sockets per key
    pub fn new(max_per_peer: usize, idle_timeout: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_per_peer,
            idle_timeout,
        }
    }

    fn bucket(&self, key: &PoolKey) -> Bucket {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        Arc::clone(self.buckets.entry(key.clone()).or_default().value())
    }

    /// Take the most recently used live socket for `key`
    ///
    /// Expired or dead sockets found on the way are closed.
    pub fn acquire(&self, key: &PoolKey) -> Option<TcpStream> {
        let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
        let mut entries = bucket.lock();

        while let Some(entry) = entries.pop() {
            if entry.last_used.elapsed() > self.idle_timeout {
                debug!("Discarding idle connection to {}:{}", key.host, key.port);
                continue;
            }
            if !is_alive(&entry.stream) {
                debug!("Discarding dead connection to {}:{}", key.host, key.port);
                continue;
            }
            return Some(entry.stream);
        }
        None
    }

    /// Return a socket to the pool, closing it if the bucket is full
    pub fn release(&self, key: &PoolKey, stream: TcpStream) {
        let bucket = self.bucket(key);
        let mut entries = bucket.lock();
        if entries.len() < self.max_per_peer {
            entries.push(PooledConnection {
                stream,
                last_used: Instant::now(),
            });
        } else {
            drop(stream);
        }
    }

    /// Close every pooled socket
    pub fn close_all(&self) {
        let closed: usize = self
            .buckets
            .iter()
            .map(|bucket| {
                let mut entries = bucket.value().lock();
                let count = entries.len();
                entries.clear();
                count
            })
            .sum();
        self.buckets.clear();
        if closed > 0 {
            debug!("Closed {} pooled connections", closed);
        }
    }

    /// Idle sockets held for `key`
    pub fn len(&self, key: &PoolKey) -> usize {
        self.buckets
            .get(key)
            .map(|bucket| bucket.value().lock().len())
            .unwrap_or(0)
    }

    /// Idle sockets held across all keys
    pub fn total(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.value().lock().len())
            .sum()
    }
}

/// A pooled socket is alive if it still has a peer and has nothing to read
fn is_alive(stream: &TcpStream) -> bool {
    if stream.peer_addr().is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    matches!(
        stream.try_read(&mut probe),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_bucket_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::new(3, Duration::from_secs(30));
        let key = PoolKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let mut remotes = Vec::new();
        for _ in 0..5 {
            let (client, remote) = connected_pair(&listener).await;
            remotes.push(remote);
            pool.release(&key, client);
        }

        assert_eq!(pool.len(&key), 3);
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.len(&PoolKey::new("127.0.0.1", 1)), 0);
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::new(3, Duration::from_secs(30));
        let key = PoolKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let (client, _remote) = connected_pair(&listener).await;
        let local = client.local_addr().unwrap();
        pool.release(&key, client);

        let reused = pool.acquire(&key).unwrap();
        assert_eq!(reused.local_addr().unwrap(), local);
        assert!(pool.acquire(&key).is_none());
    }

    #[tokio::test]
    async fn test_acquire_skips_closed_and_expired() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = PoolKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let pool = ConnectionPool::new(3, Duration::from_secs(30));
        let (client, remote) = connected_pair(&listener).await;
        pool.release(&key, client);
        drop(remote);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.acquire(&key).is_none());
        assert_eq!(pool.len(&key), 0);

        let pool = ConnectionPool::new(3, Duration::ZERO);
        let (client, _remote) = connected_pair(&listener).await;
        pool.release(&key, client);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.acquire(&key).is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::new(3, Duration::from_secs(30));
        let key = PoolKey::new("127.0.0.1", listener.local_addr().unwrap().port());

        let (client, _remote) = connected_pair(&listener).await;
        pool.release(&key, client);
        assert_eq!(pool.total(), 1);

        pool.close_all();
        assert_eq!(pool.total(), 0);
        assert!(pool.acquire(&key).is_none());
    }
}
