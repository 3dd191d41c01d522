//! Byte-stream provider.
//!
//! [`ByteLink`] wraps any `AsyncRead`/`AsyncWrite` pair (a serial device
//! node, a pseudo-terminal, or an in-memory pipe for tests) behind the
//! blocking-with-deadline read model the sync core needs. A dedicated reader
//! task drains the read half into an internal buffer, which makes
//! `available()` and `clear_input()` exact and keeps deadline reads from
//! losing bytes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, SyncError};

const READER_CHUNK: usize = 4096;

struct Shared {
    buf: Mutex<VecDeque<u8>>,
    data_ready: Notify,
    open: AtomicBool,
}

/// One end of a half-duplex byte pipe.
#[derive(Clone)]
pub struct ByteLink {
    shared: Arc<Shared>,
    writer: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl ByteLink {
    /// Wrap a read half and a write half. Spawns the reader task.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            buf: Mutex::new(VecDeque::new()),
            data_ready: Notify::new(),
            open: AtomicBool::new(true),
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            let mut chunk = [0u8; READER_CHUNK];
            loop {
                if !reader_shared.open.load(Ordering::SeqCst) {
                    break;
                }
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => {
                        reader_shared.open.store(false, Ordering::SeqCst);
                        reader_shared.data_ready.notify_waiters();
                        break;
                    }
                    Ok(n) => {
                        reader_shared.buf.lock().unwrap().extend(&chunk[..n]);
                        reader_shared.data_ready.notify_waiters();
                    }
                }
            }
        });

        Self {
            shared,
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    /// Open a serial device node (or any file-like byte pipe) read+write.
    pub async fn open_device(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        let (reader, writer) = tokio::io::split(file);
        Ok(Self::new(reader, writer))
    }

    /// Two connected in-memory links, for tests and loopback runs.
    pub fn pair() -> (ByteLink, ByteLink) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Self::new(ar, aw), Self::new(br, bw))
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Mark the link closed. Pending reads fail with `LinkClosed`.
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.data_ready.notify_waiters();
    }

    /// Bytes currently buffered and readable without waiting.
    pub fn available(&self) -> usize {
        self.shared.buf.lock().unwrap().len()
    }

    /// Discard everything in the input buffer.
    pub fn clear_input(&self) {
        self.shared.buf.lock().unwrap().clear();
    }

    /// Read one byte, waiting at most `timeout`.
    pub async fn read_byte(&self, timeout: Duration) -> Result<u8> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.shared.data_ready.notified();
            if let Some(b) = self.shared.buf.lock().unwrap().pop_front() {
                return Ok(b);
            }
            if !self.is_open() {
                return Err(SyncError::LinkClosed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Timeout(timeout));
            }
            let _ = tokio::time::timeout(remaining, ready).await;
        }
    }

    /// Read exactly `n` bytes, waiting at most `timeout` for all of them.
    pub async fn read_exact(&self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);
        loop {
            {
                let mut buf = self.shared.buf.lock().unwrap();
                while out.len() < n {
                    match buf.pop_front() {
                        Some(b) => out.push(b),
                        None => break,
                    }
                }
            }
            if out.len() == n {
                return Ok(out);
            }
            if !self.is_open() {
                return Err(SyncError::LinkClosed);
            }
            let ready = self.shared.data_ready.notified();
            if self.available() > 0 {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Timeout(timeout));
            }
            let _ = tokio::time::timeout(remaining, ready).await;
        }
    }

    /// Read a UTF-8 line. Stops at `\n`, drops `\r`. A deadline with partial
    /// content returns the partial line; an empty deadline is an error.
    pub async fn read_line(&self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut out: Vec<u8> = Vec::new();
        loop {
            loop {
                let b = match self.shared.buf.lock().unwrap().pop_front() {
                    Some(b) => b,
                    None => break,
                };
                match b {
                    b'\n' => return Ok(String::from_utf8_lossy(&out).into_owned()),
                    b'\r' => {}
                    other => out.push(other),
                }
            }
            if !self.is_open() {
                return Err(SyncError::LinkClosed);
            }
            let ready = self.shared.data_ready.notified();
            if self.available() > 0 {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if !out.is_empty() {
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                return Err(SyncError::Timeout(timeout));
            }
            let _ = tokio::time::timeout(remaining, ready).await;
        }
    }

    /// Write all bytes and flush.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(SyncError::LinkClosed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await
        {
            self.close();
            return Err(SyncError::Io(e));
        }
        Ok(())
    }

    pub async fn write_byte(&self, b: u8) -> Result<()> {
        self.write(&[b]).await
    }

    /// Write a line, appending `\n`.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_round_trips_bytes() {
        let (a, b) = ByteLink::pair();
        a.write(b"hello").await.unwrap();
        let got = b.read_exact(5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn read_byte_times_out() {
        let (a, _b) = ByteLink::pair();
        let err = a.read_byte(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn read_line_normalises_crlf() {
        let (a, b) = ByteLink::pair();
        a.write(b"one\r\ntwo\n").await.unwrap();
        assert_eq!(b.read_line(Duration::from_secs(1)).await.unwrap(), "one");
        assert_eq!(b.read_line(Duration::from_secs(1)).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn available_and_clear_input() {
        let (a, b) = ByteLink::pair();
        a.write(b"xyz").await.unwrap();
        // Give the reader task a moment to buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.available(), 3);
        b.clear_input();
        assert_eq!(b.available(), 0);
    }

    #[tokio::test]
    async fn closed_link_fails_reads() {
        let (a, b) = ByteLink::pair();
        b.close();
        drop(b);
        // The peer's reader task notices EOF once the write half is gone.
        let err = a
            .read_byte(Duration::from_secs(2))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::LinkClosed | SyncError::Timeout(_)
        ));
    }
}
