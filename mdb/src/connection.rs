use crate::config::ConnectOptions;
use crate::error::{AdbError, AdbResult};
use crate::message::{Command, Message, VERSION_NO_CHECKSUM, VERSION_WITH_CHECKSUM};
use crate::stream::{Stream, StreamEntry};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the reader loop releases the transport lock to check for
/// pending outbound frames while no inbound data is available. Purely a
/// scheduling knob; it does not affect the user-facing read/handshake
/// timeouts in `ConnectOptions`.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) struct Inner {
    pub(crate) transport: Mutex<Transport>,
    pub(crate) streams: Mutex<HashMap<u32, StreamEntry>>,
    next_local_id: AtomicU32,
    pub(crate) version: u32,
    pub(crate) max_payload: u32,
    features: HashSet<String>,
    dead: AtomicBool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Inner {
    fn verify_checksum(&self) -> bool {
        self.version == VERSION_WITH_CHECKSUM
    }

    pub(crate) fn write_message(&self, msg: &Message) -> AdbResult<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(AdbError::Disconnected);
        }
        let mut t = self.transport.lock().unwrap();
        t.set_write_timeout(self.write_timeout)?;
        msg.encode(&mut *t).map_err(|e| e.reclassify_timeout("write"))
    }

    fn teardown(&self, err: AdbError) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("connection torn down: {}", err);
        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.drain() {
            entry.fail(AdbError::Disconnected);
        }
        let t = self.transport.lock().unwrap();
        t.shutdown();
    }

    fn dispatch(&self, msg: Message) {
        match msg.command {
            Command::Okay => {
                let remote_id = msg.arg0;
                let local_id = msg.arg1;
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&local_id) {
                    entry.on_okay(remote_id);
                }
            }
            Command::Write => {
                let remote_id = msg.arg0;
                let local_id = msg.arg1;
                // Ack before doing anything else observable: the peer's
                // in-flight data is now ours, it may send the next frame.
                let ack = self.write_message(&Message::okay(local_id, remote_id));
                if let Err(e) = ack {
                    log::warn!("failed to ack WRTE on stream {}: {}", local_id, e);
                }
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&local_id) {
                    entry.on_write(msg.payload);
                } else {
                    log::debug!("WRTE for unknown stream {}, discarding", local_id);
                }
            }
            Command::Close => {
                let local_id = msg.arg1;
                let mut streams = self.streams.lock().unwrap();
                if let Some(mut entry) = streams.remove(&local_id) {
                    entry.on_close();
                } else {
                    log::debug!("CLSE for unknown stream {}, discarding", local_id);
                }
            }
            other => {
                log::error!("unexpected command {:?} after handshake", other);
                self.teardown(AdbError::UnexpectedCommand(other));
            }
        }
    }

    fn reader_loop(self: Arc<Self>) {
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            let ready = {
                let t = self.transport.lock().unwrap();
                t.peek_ready(POLL_INTERVAL)
            };
            match ready {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.teardown(e);
                    return;
                }
            }
            let msg = {
                let mut t = self.transport.lock().unwrap();
                if let Err(e) = t.set_read_timeout(self.read_timeout) {
                    self.teardown(e);
                    return;
                }
                Message::decode(&mut *t, self.verify_checksum())
                    .map_err(|e| e.reclassify_timeout("read"))
            };
            match msg {
                Ok(msg) => self.dispatch(msg),
                Err(e) => {
                    self.teardown(e);
                    return;
                }
            }
        }
    }
}

/// One live ADB connection: owns the transport, drives the handshake, and
/// is the factory for logical streams.
pub struct Connection {
    inner: Arc<Inner>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Performs the full CNXN/AUTH/STLS handshake and spawns the reader
    /// loop. Blocks until the connection reaches `Online` or the handshake
    /// fails.
    pub fn connect(addr: impl ToSocketAddrs, options: &ConnectOptions) -> AdbResult<Self> {
        let mut transport = Transport::connect(addr, options.connect_timeout)?;
        transport.set_read_timeout(options.handshake_timeout)?;

        let (transport, version, max_payload, features) = handshake(transport, options)?;

        let inner = Arc::new(Inner {
            transport: Mutex::new(transport),
            streams: Mutex::new(HashMap::new()),
            next_local_id: AtomicU32::new(1),
            version,
            max_payload,
            features,
            dead: AtomicBool::new(false),
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        });

        let reader = {
            let inner = inner.clone();
            std::thread::spawn(move || inner.reader_loop())
        };

        Ok(Self {
            inner,
            reader: Some(reader),
        })
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn max_payload(&self) -> u32 {
        self.inner.max_payload
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.inner.features.contains(feature)
    }

    /// Opens a logical stream to `destination` (e.g. `shell:<cmd>`,
    /// `sync:`, `tcp:<port>`), blocking until the peer acks or rejects it.
    pub fn open(&self, destination: &str) -> AdbResult<Stream> {
        let local_id = self.inner.next_local_id.fetch_add(1, Ordering::SeqCst);
        let (entry, opened_rx, inbox_rx, credit_rx, remote_closed) = StreamEntry::new();
        self.inner.streams.lock().unwrap().insert(local_id, entry);

        if let Err(e) = self
            .inner
            .write_message(&Message::open(local_id, destination))
        {
            self.inner.streams.lock().unwrap().remove(&local_id);
            return Err(e);
        }

        let remote_id = match opened_rx.recv() {
            Ok(Ok(remote_id)) => remote_id,
            Ok(Err(e)) => {
                self.inner.streams.lock().unwrap().remove(&local_id);
                return Err(e);
            }
            Err(_) => return Err(AdbError::Disconnected),
        };

        Ok(Stream::new(
            self.inner.clone(),
            local_id,
            remote_id,
            self.inner.max_payload as usize,
            inbox_rx,
            credit_rx,
            remote_closed,
        ))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.dead.store(true, Ordering::Release);
        {
            let t = self.inner.transport.lock().unwrap();
            t.shutdown();
        }
        if let Some(reader) = self.reader.take() {
            reader.join().ok();
        }
    }
}

/// Runs the CNXN/AUTH/STLS exchange described in SPEC_FULL.md §4.4, looping
/// over STLS upgrades (at most one is expected in practice, but the wire
/// protocol does not forbid re-negotiating after an upgrade). Takes and
/// returns the transport by value since an STLS upgrade consumes the plain
/// socket and produces a distinct TLS-wrapped one.
fn handshake(
    mut transport: Transport,
    options: &ConnectOptions,
) -> AdbResult<(Transport, u32, u32, HashSet<String>)> {
    let mut upgraded = false;
    loop {
        let banner = options.banner();
        Message::connect(VERSION_NO_CHECKSUM, crate::message::MAX_PAYLOAD, &banner)
            .encode(&mut transport)?;

        let mut key_index = 0;
        // Set once AUTH-3 (our public key) has gone out: from this point, the
        // device closing the connection means it rejected the key, not just
        // a dead transport, per §4.4's "device must confirm" wait.
        let mut awaiting_confirmation = false;
        loop {
            // Before negotiation completes we don't yet know which checksum
            // policy applies; accept either by not enforcing it.
            let msg = Message::decode(&mut transport, false).map_err(|e| {
                let e = e.reclassify_timeout("handshake");
                if awaiting_confirmation {
                    e.reclassify_disconnect_as_auth()
                } else {
                    e
                }
            })?;
            match msg.command {
                Command::Connect => {
                    let (features, max_payload) = parse_banner(&msg.payload, msg.arg1);
                    return Ok((transport, msg.arg0, max_payload, features));
                }
                Command::Auth => {
                    if key_index < options.keys.len() {
                        let signature = options.keys[key_index].sign(&msg.payload)?;
                        Message::new(Command::Auth, 2, 0, signature).encode(&mut transport)?;
                        key_index += 1;
                    } else {
                        let mut payload = options.keys[0].public_blob()?.into_bytes();
                        payload.pop(); // drop the blob's own NUL, we append " name\0" below
                        payload.push(b' ');
                        payload.extend_from_slice(options.name.as_bytes());
                        payload.push(0);
                        transport.set_read_timeout(options.handshake_timeout)?;
                        Message::new(Command::Auth, 3, 0, payload).encode(&mut transport)?;
                        awaiting_confirmation = true;
                    }
                }
                Command::Stls if !upgraded => {
                    Message::new(Command::Stls, VERSION_NO_CHECKSUM, 0, vec![])
                        .encode(&mut transport)?;
                    transport = transport.upgrade_to_tls(&options.keys[0])?;
                    upgraded = true;
                    break;
                }
                other => return Err(AdbError::UnexpectedCommand(other)),
            }
        }
    }
}

fn parse_banner(payload: &[u8], their_max_payload: u32) -> (HashSet<String>, u32) {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\0');
    let mut features = HashSet::new();
    if let Some((_, props)) = text.split_once("::") {
        for kv in props.split(';') {
            if let Some((key, value)) = kv.split_once('=') {
                if key == "features" {
                    features.extend(value.split(',').map(|s| s.to_string()));
                }
            }
        }
    }
    let max_payload = their_max_payload.min(crate::message::MAX_PAYLOAD).max(4096);
    (features, max_payload)
}
