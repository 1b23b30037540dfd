//! Speaks the Android Debug Bridge wire protocol directly to a device's
//! `adbd` over TCP, without routing through a local `adb` host server.
//!
//! [`Connection`] owns the transport and drives the CNXN/AUTH/STLS
//! handshake; [`Stream`] is one multiplexed logical channel on top of it;
//! [`sync::SyncConnection`] layers file push/pull/stat/list over a
//! `sync:` stream; [`pairing`] performs the TLS+SPAKE2 wireless-pairing
//! exchange; [`forward::Forwarder`] bridges a local TCP port to a
//! device-side `tcp:<port>` stream.

pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod key;
pub mod message;
pub mod pairing;
pub mod pubkey;
pub mod stream;
pub mod sync;
pub mod transport;

pub use config::{ConnectOptions, PairingOptions};
pub use connection::Connection;
pub use error::{AdbError, AdbResult};
pub use forward::Forwarder;
pub use key::AdbKey;
pub use message::{Command, Message};
pub use stream::{Stream, StreamReadHalf, StreamWriteHalf};

#[cfg(test)]
mod tests {
    //! End-to-end handshake and stream tests against an in-memory scripted
    //! peer, standing in for the real-device integration tests the teacher
    //! crate ran over actual USB/TCP hardware (not reproducible here).
    use super::*;
    use crate::message::{Command as Cmd, VERSION_NO_CHECKSUM};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    /// Spawns a real loopback TCP listener and runs `peer` against the
    /// accepted socket on its own thread, returning the address to connect
    /// to. `Connection::connect` only speaks to real sockets, so this is
    /// the one piece of test plumbing this crate adds beyond the teacher's
    /// own `#[cfg(test)]` conventions.
    fn scripted_peer(peer: impl FnOnce(TcpStream) + Send + 'static) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            peer(socket);
        });
        addr
    }

    fn read_message(socket: &mut TcpStream) -> Message {
        Message::decode(socket, false).unwrap()
    }

    fn write_message(socket: &mut TcpStream, msg: &Message) {
        msg.encode(socket).unwrap();
    }

    #[test]
    fn handshake_no_auth_device_reaches_online() {
        env_logger::try_init().ok();
        let addr = scripted_peer(|mut socket| {
            let cnxn = read_message(&mut socket);
            assert_eq!(cnxn.command, Cmd::Connect);
            let reply = Message::connect(VERSION_NO_CHECKSUM, 1024 * 1024, "device::features=shell_v2");
            write_message(&mut socket, &reply);
            // Keep the socket open for the reader thread's lifetime.
            std::thread::sleep(Duration::from_millis(200));
        });

        let key = AdbKey::generate("test").unwrap();
        let options = ConnectOptions::new(key);
        let connection = Connection::connect(addr, &options).unwrap();
        assert!(connection.supports("shell_v2"));
        assert!(!connection.supports("cmd"));
    }

    #[test]
    fn handshake_single_key_auth_path() {
        env_logger::try_init().ok();
        let key = AdbKey::generate("test").unwrap();

        let addr = scripted_peer(move |mut socket| {
            let cnxn = read_message(&mut socket);
            assert_eq!(cnxn.command, Cmd::Connect);

            let token = vec![7u8; 20];
            write_message(&mut socket, &Message::new(Cmd::Auth, 1, 0, token));

            let signed = read_message(&mut socket);
            assert_eq!(signed.command, Cmd::Auth);
            assert_eq!(signed.arg0, 2);

            // Second AUTH(1, ...) forces the public-key path since we only
            // gave the connection one key.
            write_message(&mut socket, &Message::new(Cmd::Auth, 1, 0, vec![9u8; 20]));

            let pubkey = read_message(&mut socket);
            assert_eq!(pubkey.command, Cmd::Auth);
            assert_eq!(pubkey.arg0, 3);
            assert!(pubkey.payload.ends_with(b"test\0"));

            let reply = Message::connect(VERSION_NO_CHECKSUM, 1024 * 1024, "device::features=shell_v2");
            write_message(&mut socket, &reply);
            std::thread::sleep(Duration::from_millis(200));
        });

        let options = ConnectOptions::new(key);
        let connection = Connection::connect(addr, &options).unwrap();
        assert!(connection.supports("shell_v2"));
    }

    #[test]
    fn open_stream_then_shell_echo() {
        env_logger::try_init().ok();
        let addr = scripted_peer(|mut socket| {
            let cnxn = read_message(&mut socket);
            assert_eq!(cnxn.command, Cmd::Connect);
            write_message(
                &mut socket,
                &Message::connect(VERSION_NO_CHECKSUM, 1024 * 1024, "device::features=shell_v2"),
            );

            let open = read_message(&mut socket);
            assert_eq!(open.command, Cmd::Open);
            assert_eq!(open.payload, b"shell:echo hi\0");
            let local_id = open.arg0;
            write_message(&mut socket, &Message::okay(1, local_id));

            write_message(&mut socket, &Message::write(1, local_id, b"hi\n".to_vec()));
            let ack = read_message(&mut socket);
            assert_eq!(ack.command, Cmd::Okay);

            write_message(&mut socket, &Message::close(1, local_id));
            std::thread::sleep(Duration::from_millis(200));
        });

        let key = AdbKey::generate("test").unwrap();
        let connection = Connection::connect(addr, &ConnectOptions::new(key)).unwrap();
        let mut stream = connection.open("shell:echo hi").unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn stream_rejected_surfaces_as_error_without_killing_connection() {
        env_logger::try_init().ok();
        let addr = scripted_peer(|mut socket| {
            let cnxn = read_message(&mut socket);
            assert_eq!(cnxn.command, Cmd::Connect);
            write_message(
                &mut socket,
                &Message::connect(VERSION_NO_CHECKSUM, 1024 * 1024, "device::features=shell_v2"),
            );

            let open1 = read_message(&mut socket);
            assert_eq!(open1.command, Cmd::Open);
            write_message(&mut socket, &Message::close(0, open1.arg0));

            let open2 = read_message(&mut socket);
            assert_eq!(open2.command, Cmd::Open);
            write_message(&mut socket, &Message::okay(2, open2.arg0));
            std::thread::sleep(Duration::from_millis(200));
        });

        let key = AdbKey::generate("test").unwrap();
        let connection = Connection::connect(addr, &ConnectOptions::new(key)).unwrap();

        let rejected = connection.open("root:");
        assert!(matches!(rejected, Err(AdbError::StreamRejected)));

        let ok = connection.open("shell:echo ok");
        assert!(ok.is_ok());
    }
}
