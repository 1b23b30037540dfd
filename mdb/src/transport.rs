use crate::error::{AdbError, AdbResult};
use crate::key::AdbKey;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Raw byte pipe: plain TCP, or a TLS upgrade of one. Both variants satisfy
/// the same read/write/close capability set; modelled as an enum rather
/// than a trait object since there are exactly two cases and no caller ever
/// supplies a third.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Transport {
    pub fn connect(addr: impl ToSocketAddrs, connect_timeout: Option<Duration>) -> AdbResult<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AdbError::Protocol("no address to connect to".into()))?;
        let stream = match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)
                .map_err(|e| crate::error::io_timeout_or_transport(e, "connect"))?,
            None => TcpStream::connect(addr)?,
        };
        Ok(Transport::Plain(stream))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> AdbResult<()> {
        self.tcp_stream().set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> AdbResult<()> {
        self.tcp_stream().set_write_timeout(timeout)?;
        Ok(())
    }

    fn tcp_stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tcp_stream().shutdown(std::net::Shutdown::Both);
    }

    /// Polls whether at least one byte is available to read, without
    /// consuming it, bounded by `timeout`. Used by the connection engine's
    /// reader loop to release the transport mutex between frames instead of
    /// blocking inside `Message::decode` for an indefinite, lock-held read.
    pub fn peek_ready(&self, timeout: Duration) -> AdbResult<bool> {
        let sock = self.tcp_stream();
        sock.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 1];
        match sock.peek(&mut buf) {
            Ok(0) => Err(AdbError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ))),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Performs the STLS client handshake over an existing plain transport,
    /// presenting `key`'s self-signed identity and accepting any server
    /// certificate (SPAKE2/identity is validated out of band for pairing;
    /// for a normal STLS upgrade the device is already authenticated by the
    /// surrounding AUTH handshake).
    pub fn upgrade_to_tls(self, key: &AdbKey) -> AdbResult<Self> {
        let stream = match self {
            Transport::Plain(s) => s,
            Transport::Tls(_) => {
                return Err(AdbError::Protocol("transport already upgraded to TLS".into()))
            }
        };
        let config = client_config(key)?;
        let name = rustls::ServerName::try_from("adb")
            .map_err(|_| AdbError::Protocol("invalid TLS server name".into()))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), name)
            .map_err(|e| AdbError::Protocol(format!("TLS setup failed: {}", e)))?;
        Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(conn, stream))))
    }

    /// Exports keying material from the underlying TLS session — only
    /// meaningful once the handshake has completed, which happens lazily on
    /// first read/write through `rustls::StreamOwned`.
    pub fn export_keying_material(&mut self, label: &[u8], length: usize) -> AdbResult<Vec<u8>> {
        match self {
            Transport::Tls(stream) => {
                // Force the handshake to complete before exporting.
                stream.conn.complete_io(&mut stream.sock)?;
                let mut out = vec![0u8; length];
                stream
                    .conn
                    .export_keying_material(&mut out, label, None)
                    .map_err(|e| AdbError::Protocol(format!("keying material export failed: {}", e)))?;
                Ok(out)
            }
            Transport::Plain(_) => Err(AdbError::Protocol(
                "keying material export requires a TLS transport".into(),
            )),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// A self-signed certificate and its PKCS#8 key, both derived from an
/// `AdbKey`'s RSA keypair — the identity ADB presents when it is the TLS
/// client (STLS upgrade, pairing).
pub fn self_signed_identity(key: &AdbKey) -> AdbResult<(rustls::Certificate, rustls::PrivateKey)> {
    let pkcs8 = key.pkcs8_der()?;
    let key_pair = rcgen::KeyPair::from_der(&pkcs8)
        .map_err(|e| AdbError::Protocol(format!("building TLS keypair: {}", e)))?;
    let mut params = rcgen::CertificateParams::new(vec![]);
    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, key.name());
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| AdbError::Protocol(format!("generating self-signed certificate: {}", e)))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| AdbError::Protocol(format!("serializing certificate: {}", e)))?;
    Ok((rustls::Certificate(cert_der), rustls::PrivateKey(pkcs8)))
}

fn client_config(key: &AdbKey) -> AdbResult<rustls::ClientConfig> {
    let (cert, private_key) = self_signed_identity(key)?;
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_single_cert(vec![cert], private_key)
        .map_err(|e| AdbError::Protocol(format!("building TLS client config: {}", e)))?;
    Ok(config)
}

/// The pairing and STLS protocols validate the peer out of band (SPAKE2's
/// shared secret, or the surrounding AUTH handshake); the TLS layer itself
/// is not asked to pin a certificate authority.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
