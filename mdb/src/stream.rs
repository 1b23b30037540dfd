use crate::connection::Inner;
use crate::error::{AdbError, AdbResult};
use crate::message::Message;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The connection engine's side of a stream: channels fed by the reader
/// thread's dispatch loop, and the bookkeeping needed to tell a graceful
/// remote close apart from the whole connection going away.
pub(crate) struct StreamEntry {
    opened_tx: Option<Sender<AdbResult<u32>>>,
    inbox_tx: Sender<Vec<u8>>,
    credit_tx: Sender<()>,
    remote_closed: Arc<AtomicBool>,
}

impl StreamEntry {
    pub(crate) fn new() -> (
        Self,
        Receiver<AdbResult<u32>>,
        Receiver<Vec<u8>>,
        Receiver<()>,
        Arc<AtomicBool>,
    ) {
        let (opened_tx, opened_rx) = bounded(1);
        let (inbox_tx, inbox_rx) = unbounded();
        let (credit_tx, credit_rx) = bounded(1);
        let remote_closed = Arc::new(AtomicBool::new(false));
        let entry = Self {
            opened_tx: Some(opened_tx),
            inbox_tx,
            credit_tx,
            remote_closed: remote_closed.clone(),
        };
        (entry, opened_rx, inbox_rx, credit_rx, remote_closed)
    }

    /// First OKAY after OPEN carries the peer's remote id and grants the
    /// first unit of write credit; later OKAYs only grant credit.
    pub(crate) fn on_okay(&mut self, remote_id: u32) {
        if let Some(tx) = self.opened_tx.take() {
            let _ = tx.send(Ok(remote_id));
        } else {
            let _ = self.credit_tx.try_send(());
        }
    }

    pub(crate) fn on_write(&mut self, payload: Vec<u8>) {
        let _ = self.inbox_tx.send(payload);
    }

    pub(crate) fn on_close(&mut self) {
        self.remote_closed.store(true, Ordering::Release);
        if let Some(tx) = self.opened_tx.take() {
            let _ = tx.send(Err(AdbError::StreamRejected));
        }
        // Dropping inbox_tx/credit_tx here (when self is dropped by the
        // caller) wakes any blocked read()/write() with a disconnect, which
        // Stream interprets as EOF because remote_closed is already set.
    }

    pub(crate) fn fail(&mut self, err: AdbError) {
        self.remote_closed.store(true, Ordering::Release);
        if let Some(tx) = self.opened_tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// What a `Stream` and its two split halves all share: the handle needed to
/// send a frame and the one-shot close bookkeeping. Holding this behind an
/// `Arc` (rather than a strong back-reference from the registry) is what
/// keeps the engine<->stream relationship acyclic — see SPEC_FULL.md's
/// cyclic-ownership note.
struct Shared {
    inner: Arc<Inner>,
    local_id: u32,
    remote_id: u32,
    max_payload: usize,
    closed: AtomicBool,
}

impl Shared {
    /// Sends `CLSE` and frees the registry slot if this hasn't already run
    /// (from an explicit `close()` call on either half, or this `Drop`).
    /// The `local_id` itself is never reused regardless of how many times
    /// this fires.
    fn close(&self) -> AdbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.streams.lock().unwrap().remove(&self.local_id);
        self.inner
            .write_message(&Message::close(self.local_id, self.remote_id))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A single logical stream multiplexed over one `Connection`: a duplex byte
/// pipe bound to a `destination` string (`shell:`, `sync:`, `tcp:<port>`,
/// ...), gated by the peer's OKAY-based write credit.
pub struct Stream {
    shared: Arc<Shared>,
    inbox_rx: Receiver<Vec<u8>>,
    credit_rx: Receiver<()>,
    pending: Vec<u8>,
    remote_closed: Arc<AtomicBool>,
}

/// The read half of a `Stream` split with [`Stream::split`].
pub struct StreamReadHalf {
    shared: Arc<Shared>,
    inbox_rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    remote_closed: Arc<AtomicBool>,
}

/// The write half of a `Stream` split with [`Stream::split`].
pub struct StreamWriteHalf {
    shared: Arc<Shared>,
    credit_rx: Receiver<()>,
    remote_closed: Arc<AtomicBool>,
}

impl Stream {
    pub(crate) fn new(
        inner: Arc<Inner>,
        local_id: u32,
        remote_id: u32,
        max_payload: usize,
        inbox_rx: Receiver<Vec<u8>>,
        credit_rx: Receiver<()>,
        remote_closed: Arc<AtomicBool>,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner,
            local_id,
            remote_id,
            max_payload,
            closed: AtomicBool::new(false),
        });
        Self {
            shared,
            inbox_rx,
            credit_rx,
            pending: Vec::new(),
            remote_closed,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.shared.remote_id
    }

    /// Reads the next chunk the peer wrote, blocking until one arrives or
    /// the stream is closed. Returns `Ok(None)` on a graceful remote close
    /// with nothing left buffered (EOF); an `Err` means the underlying
    /// connection is gone.
    pub fn recv(&mut self) -> AdbResult<Option<Vec<u8>>> {
        recv_chunk(&self.inbox_rx, &self.remote_closed)
    }

    /// Writes `data`, chunked to the negotiated max payload, blocking on
    /// the peer's OKAY credit before each chunk past the first.
    pub fn send(&mut self, data: &[u8]) -> AdbResult<()> {
        send_chunked(&self.shared, &self.credit_rx, &self.remote_closed, data)
    }

    /// Sends CLSE if it hasn't already gone out; idempotent.
    pub fn close(&mut self) -> AdbResult<()> {
        self.shared.close()
    }

    /// Splits the duplex stream into independent halves so a forwarder (or
    /// any other bidirectional bridge) can run the read side and the write
    /// side on separate threads without contending on a single `&mut
    /// Stream`. `CLSE` goes out once both halves have been dropped (or
    /// either has called `close()` explicitly), never twice.
    pub fn split(self) -> (StreamReadHalf, StreamWriteHalf) {
        let read = StreamReadHalf {
            shared: self.shared.clone(),
            inbox_rx: self.inbox_rx,
            pending: self.pending,
            remote_closed: self.remote_closed.clone(),
        };
        let write = StreamWriteHalf {
            shared: self.shared,
            credit_rx: self.credit_rx,
            remote_closed: self.remote_closed,
        };
        (read, write)
    }
}

impl StreamReadHalf {
    pub fn recv(&mut self) -> AdbResult<Option<Vec<u8>>> {
        recv_chunk(&self.inbox_rx, &self.remote_closed)
    }

    pub fn close(&self) -> AdbResult<()> {
        self.shared.close()
    }
}

impl StreamWriteHalf {
    pub fn send(&mut self, data: &[u8]) -> AdbResult<()> {
        send_chunked(&self.shared, &self.credit_rx, &self.remote_closed, data)
    }

    pub fn close(&self) -> AdbResult<()> {
        self.shared.close()
    }

    /// Half-closes just this direction's peer-visible state, for a
    /// forwarder whose local side hit EOF: the other half stays usable
    /// until it independently closes or drops.
    pub fn shutdown_write(&self) {
        let _ = self.close();
    }
}

fn recv_chunk(inbox_rx: &Receiver<Vec<u8>>, remote_closed: &AtomicBool) -> AdbResult<Option<Vec<u8>>> {
    match inbox_rx.recv() {
        Ok(chunk) => Ok(Some(chunk)),
        Err(_) => {
            if remote_closed.load(Ordering::Acquire) {
                Ok(None)
            } else {
                Err(AdbError::Disconnected)
            }
        }
    }
}

fn send_chunked(
    shared: &Shared,
    credit_rx: &Receiver<()>,
    remote_closed: &AtomicBool,
    data: &[u8],
) -> AdbResult<()> {
    if shared.closed.load(Ordering::Acquire) {
        return Err(AdbError::StreamClosed);
    }
    if data.is_empty() {
        return Ok(());
    }
    for chunk in data.chunks(shared.max_payload) {
        shared
            .inner
            .write_message(&Message::write(shared.local_id, shared.remote_id, chunk.to_vec()))?;
        match credit_rx.recv() {
            Ok(()) => {}
            Err(_) => {
                if remote_closed.load(Ordering::Acquire) {
                    return Err(AdbError::StreamClosed);
                }
                return Err(AdbError::Disconnected);
            }
        }
    }
    Ok(())
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        read_pending(&mut self.pending, &self.inbox_rx, &self.remote_closed, buf)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.send(buf)
            .map(|_| buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for StreamReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        read_pending(&mut self.pending, &self.inbox_rx, &self.remote_closed, buf)
    }
}

impl Write for StreamWriteHalf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.send(buf)
            .map(|_| buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn read_pending(
    pending: &mut Vec<u8>,
    inbox_rx: &Receiver<Vec<u8>>,
    remote_closed: &AtomicBool,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    if pending.is_empty() {
        match recv_chunk(inbox_rx, remote_closed) {
            Ok(Some(chunk)) => *pending = chunk,
            Ok(None) => return Ok(0),
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }
    let n = buf.len().min(pending.len());
    buf[..n].copy_from_slice(&pending[..n]);
    pending.drain(..n);
    Ok(n)
}

impl Iterator for Stream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.recv().ok().flatten()
    }
}
