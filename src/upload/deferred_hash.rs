//! Deferred content hash
//!
//! When a part's hash is only known once its bytes have been produced, the
//! producer appends the 40 hex digits of the hash to the body and sends
//! `hex_digits_at_end` as the hash header. [`DeferredHashReader`] passes the
//! body through untouched and keeps the final 40 bytes so the hash can be
//! recorded once the upload succeeds.

use crate::api::{Error, Result};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Length of a hex-encoded SHA-1 digest
pub const HASH_HEX_LEN: usize = 40;

#[derive(Debug)]
struct Window {
    remaining: u64,
    width: usize,
    buf: [u8; HASH_HEX_LEN],
}

impl Window {
    fn new(size: u64) -> Self {
        Self {
            remaining: size,
            width: size.min(HASH_HEX_LEN as u64) as usize,
            buf: [0; HASH_HEX_LEN],
        }
    }

    /// Record `chunk`, the next bytes of the stream.
    fn observe(&mut self, chunk: &[u8]) {
        let n = chunk.len() as u64;
        let r = self.remaining;
        let w = self.width as u64;
        // chunk[i] is followed by r - i - 1 more bytes; only the last w land in the window
        let start = r.saturating_sub(w).min(n);
        let end = r.min(n);
        if start < end {
            let at = (w - (r - start)) as usize;
            let len = (end - start) as usize;
            self.buf[at..at + len].copy_from_slice(&chunk[start as usize..end as usize]);
        }
        self.remaining = r.saturating_sub(n);
    }
}

/// Shared view of the bytes captured by a [`DeferredHashReader`].
#[derive(Debug, Clone)]
pub struct DeferredHash {
    window: Arc<Mutex<Window>>,
}

impl DeferredHash {
    /// Bytes of the declared length not yet seen
    pub fn remaining(&self) -> u64 {
        self.window.lock().remaining
    }

    /// The trailing bytes seen so far: the last 40, or every byte of a
    /// shorter stream.
    pub fn captured(&self) -> Vec<u8> {
        let window = self.window.lock();
        window.buf[..window.width].to_vec()
    }

    /// The hash carried at the end of a fully consumed stream.
    pub fn resolve(&self) -> Result<String> {
        let window = self.window.lock();
        if window.remaining > 0 {
            return Err(Error::DeferredHash(format!(
                "stream ended {} bytes short",
                window.remaining
            )));
        }
        if window.width < HASH_HEX_LEN {
            return Err(Error::DeferredHash(format!(
                "stream of {} bytes cannot carry a hash",
                window.width
            )));
        }
        hex::decode(window.buf).map_err(|e| Error::DeferredHash(e.to_string()))?;
        Ok(String::from_utf8_lossy(&window.buf).into_owned())
    }
}

pin_project! {
    /// Pass-through reader that captures the last 40 bytes of a stream of
    /// known length.
    ///
    /// # Example
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use b2_engine::upload::DeferredHashReader;
    /// use tokio::io::AsyncReadExt;
    ///
    /// let mut body = b"payload".to_vec();
    /// body.extend_from_slice(b"da39a3ee5e6b4b0d3255bfef95601890afd80709");
    /// let size = body.len() as u64;
    ///
    /// let mut reader = DeferredHashReader::new(&body[..], size);
    /// let hash = reader.hash();
    /// let mut sink = Vec::new();
    /// reader.read_to_end(&mut sink).await.unwrap();
    /// assert_eq!(hash.resolve().unwrap(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    /// # });
    /// ```
    #[derive(Debug)]
    pub struct DeferredHashReader<R> {
        #[pin]
        inner: R,
        hash: DeferredHash,
    }
}

impl<R> DeferredHashReader<R> {
    /// Wrap `inner`, which will yield exactly `size` bytes.
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            hash: DeferredHash {
                window: Arc::new(Mutex::new(Window::new(size))),
            },
        }
    }

    /// Handle that stays valid after the reader has been moved into a body.
    pub fn hash(&self) -> DeferredHash {
        self.hash.clone()
    }
}

impl<R: AsyncRead> AsyncRead for DeferredHashReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        if !chunk.is_empty() {
            this.hash.window.lock().observe(chunk);
        }
        Poll::Ready(Ok(()))
    }
}
