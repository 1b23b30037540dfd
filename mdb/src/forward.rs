use crate::connection::Connection;
use crate::error::AdbResult;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Bridges a local TCP port to a device-side `tcp:<port>` stream: for every
/// accepted local connection, opens one new stream and runs two blocking
/// copy loops, one per direction, matching the one-thread-per-direction
/// shape the connection engine already uses for its reader/writer split.
pub struct Forwarder {
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Forwarder {
    /// Starts listening on `local_port` and forwarding every accepted
    /// connection to the device's `tcp:<remote_port>`.
    pub fn start(connection: Arc<Connection>, local_port: u16, remote_port: u16) -> AdbResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let stop = stop.clone();
            std::thread::spawn(move || accept_loop(listener, connection, remote_port, stop))
        };

        Ok(Self {
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    /// Closes the listener and tears down every still-running forwarded
    /// pair. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            handle.join().ok();
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, connection: Arc<Connection>, remote_port: u16, stop: Arc<AtomicBool>) {
    let mut pairs = Vec::new();
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((socket, _addr)) => {
                let connection = connection.clone();
                pairs.push(std::thread::spawn(move || {
                    if let Err(e) = bridge_one(connection, socket, remote_port) {
                        log::warn!("forwarder pair to tcp:{} ended: {}", remote_port, e);
                    }
                }));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("forwarder accept failed, stopping: {}", e);
                break;
            }
        }
    }
    for pair in pairs {
        pair.join().ok();
    }
}

fn bridge_one(connection: Arc<Connection>, local: TcpStream, remote_port: u16) -> AdbResult<()> {
    let stream = connection.open(&format!("tcp:{}", remote_port))?;
    let mut local_read = local.try_clone()?;
    let mut local_write = local;
    let (mut stream_read, mut stream_write) = stream.split();

    let reader = std::thread::spawn(move || {
        let _ = io::copy(&mut local_read, &mut stream_write);
        stream_write.shutdown_write();
    });
    let result = io::copy(&mut stream_read, &mut local_write);
    let _ = local_write.shutdown(std::net::Shutdown::Write);
    reader.join().ok();
    result.map(|_| ()).map_err(Into::into)
}
