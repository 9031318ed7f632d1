use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Output buffer that keeps at most `limit` bytes.
///
/// Bytes beyond the limit are counted and dropped, so a producer writing
/// forever never blocks on a full pipe and never grows our memory.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Moves the collected bytes out, leaving an empty buffer with the same limit
    pub fn take(&mut self) -> Self {
        let limit = self.limit;
        std::mem::replace(self, Self::new(limit))
    }

    pub fn into_string(self) -> String {
        if self.dropped > 0 {
            log::debug!("Output truncated, {} bytes dropped", self.dropped);
        }
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Drains `reader` to the end, keeping the first `limit` bytes.
pub async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<CappedBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.push(&chunk[..n]);
    }
    Ok(buffer)
}

/// Buffer shared between a reader task and whoever waits for it, so the
/// bytes read so far survive an aborted reader.
pub type SharedBuffer = Arc<Mutex<CappedBuffer>>;

/// Drains `reader` into `buffer` until end of stream.
pub async fn read_shared<R>(mut reader: R, buffer: SharedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.lock().push(&chunk[..n]);
    }
}

/// Cuts `text` to at most `limit` bytes on a character boundary
pub fn truncate_utf8(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}
