use crate::connection::Connection;
use crate::error::{AdbError, AdbResult};
use crate::stream::Stream;
use byteorder::{ByteOrder, LE};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default mode applied to a pushed file when the caller doesn't supply one.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default mode for directories created through this protocol. Nothing in
/// this crate issues a `mkdir`-equivalent sync command yet, but real `adbd`
/// peers use this value and callers composing their own `SEND` paths may
/// need it.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

const MAX_DATA_CHUNK: usize = 64 * 1024;

/// One directory entry as returned by `stat` or `list`. `name` is set for
/// `list` entries and `None` for a bare `stat`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncEntry {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
    pub name: Option<String>,
}

struct Frame {
    id: [u8; 4],
    len: u32,
    body: Vec<u8>,
}

/// File push/pull/stat/list layered over one logical stream opened with
/// destination `sync:`. Every frame is `{id[4], len: u32 LE, body[len]}`
/// except `DONE`, whose `len` field carries the upload mtime instead of a
/// body length.
pub struct SyncConnection {
    stream: Stream,
}

impl SyncConnection {
    pub fn open(connection: &Connection) -> AdbResult<Self> {
        Ok(Self {
            stream: connection.open("sync:")?,
        })
    }

    /// Uploads `data` to `remote_path`. `mode` defaults to `0o644`, `mtime`
    /// to the current wall-clock time in seconds since epoch.
    pub fn push(
        &mut self,
        mut data: impl Read,
        remote_path: &str,
        mode: Option<u32>,
        mtime: Option<u32>,
    ) -> AdbResult<()> {
        let mode = mode.unwrap_or(DEFAULT_FILE_MODE);
        let header = format!("{},{}", remote_path, mode);
        write_frame(&mut self.stream, b"SEND", header.as_bytes())?;

        let mut buf = vec![0u8; MAX_DATA_CHUNK];
        loop {
            let n = fill_chunk(&mut data, &mut buf)?;
            if n == 0 {
                break;
            }
            write_frame(&mut self.stream, b"DATA", &buf[..n])?;
        }

        let mtime = mtime.unwrap_or_else(epoch_secs);
        write_done(&mut self.stream, mtime)?;
        self.expect_okay()
    }

    /// Downloads `remote_path`, accumulating `DATA` bodies until `DONE`.
    pub fn pull(&mut self, remote_path: &str) -> AdbResult<Vec<u8>> {
        write_frame(&mut self.stream, b"RECV", remote_path.as_bytes())?;
        let mut out = Vec::new();
        loop {
            let frame = read_frame(&mut self.stream)?;
            match &frame.id {
                b"DATA" => out.extend_from_slice(&frame.body),
                b"DONE" => break,
                b"FAIL" => return Err(sync_fail(&frame)),
                id => return Err(unexpected_id(id)),
            }
        }
        Ok(out)
    }

    /// Single stat query; the device answers with one `STAT` frame whose
    /// body is `mode|size|mtime`, each a LE u32.
    pub fn stat(&mut self, remote_path: &str) -> AdbResult<SyncEntry> {
        write_frame(&mut self.stream, b"STAT", remote_path.as_bytes())?;
        let frame = read_frame(&mut self.stream)?;
        match &frame.id {
            b"STAT" => parse_stat_body(&frame.body, None),
            b"FAIL" => Err(sync_fail(&frame)),
            id => Err(unexpected_id(id)),
        }
    }

    /// Lists a directory: zero or more `DENT` frames followed by `DONE`.
    pub fn list(&mut self, remote_path: &str) -> AdbResult<Vec<SyncEntry>> {
        write_frame(&mut self.stream, b"LIST", remote_path.as_bytes())?;
        let mut entries = Vec::new();
        loop {
            let frame = read_frame(&mut self.stream)?;
            match &frame.id {
                b"DENT" => entries.push(parse_dent_body(&frame.body)?),
                b"DONE" => break,
                b"FAIL" => return Err(sync_fail(&frame)),
                id => return Err(unexpected_id(id)),
            }
        }
        Ok(entries)
    }

    /// Closes the sync session. Consumes `self`: a `QUIT`ed session has
    /// nothing further to do but drop the underlying stream.
    pub fn quit(mut self) -> AdbResult<()> {
        write_frame(&mut self.stream, b"QUIT", b"")?;
        self.stream.close()
    }

    fn expect_okay(&mut self) -> AdbResult<()> {
        let frame = read_frame(&mut self.stream)?;
        match &frame.id {
            b"OKAY" => Ok(()),
            b"FAIL" => Err(sync_fail(&frame)),
            id => Err(unexpected_id(id)),
        }
    }
}

fn sync_fail(frame: &Frame) -> AdbError {
    AdbError::Sync(String::from_utf8_lossy(&frame.body).into_owned())
}

fn unexpected_id(id: &[u8; 4]) -> AdbError {
    AdbError::Protocol(format!(
        "unexpected SYNC id {:?}",
        String::from_utf8_lossy(id)
    ))
}

fn parse_stat_body(body: &[u8], name: Option<String>) -> AdbResult<SyncEntry> {
    if body.len() < 12 {
        return Err(AdbError::Protocol("truncated STAT body".into()));
    }
    Ok(SyncEntry {
        mode: LE::read_u32(&body[0..4]),
        size: LE::read_u32(&body[4..8]),
        mtime: LE::read_u32(&body[8..12]),
        name,
    })
}

fn parse_dent_body(body: &[u8]) -> AdbResult<SyncEntry> {
    if body.len() < 16 {
        return Err(AdbError::Protocol("truncated DENT body".into()));
    }
    let name_len = LE::read_u32(&body[12..16]) as usize;
    let name_bytes = body
        .get(16..16 + name_len)
        .ok_or_else(|| AdbError::Protocol("DENT name_len exceeds body".into()))?;
    let mut entry = parse_stat_body(&body[..12], None)?;
    entry.name = Some(String::from_utf8_lossy(name_bytes).into_owned());
    Ok(entry)
}

fn write_frame(stream: &mut Stream, id: &[u8; 4], body: &[u8]) -> AdbResult<()> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(id);
    let mut len_buf = [0u8; 4];
    LE::write_u32(&mut len_buf, body.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(body);
    stream.write_all(&buf)?;
    Ok(())
}

fn write_done(stream: &mut Stream, mtime: u32) -> AdbResult<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(b"DONE");
    LE::write_u32(&mut buf[4..8], mtime);
    stream.write_all(&buf)?;
    Ok(())
}

/// Reads one SYNC frame off `stream`'s `Read` impl via `read_exact`, never
/// assuming a single `read()` call returns a whole frame — `DONE` is the
/// one id whose `len` field is the mtime, not a body length to read.
fn read_frame(stream: &mut Stream) -> AdbResult<Frame> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let id = [header[0], header[1], header[2], header[3]];
    let len = LE::read_u32(&header[4..8]);
    if id == *b"DONE" {
        return Ok(Frame { id, len, body: Vec::new() });
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(Frame { id, len, body })
}

fn fill_chunk(r: &mut impl Read, buf: &mut [u8]) -> AdbResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_body_parses_three_le_u32s() {
        let mut body = [0u8; 12];
        LE::write_u32(&mut body[0..4], 0o100600);
        LE::write_u32(&mut body[4..8], 1_048_576);
        LE::write_u32(&mut body[8..12], 1_700_000_000);
        let entry = parse_stat_body(&body, None).unwrap();
        assert_eq!(entry.mode, 0o100600);
        assert_eq!(entry.size, 1_048_576);
        assert_eq!(entry.mtime, 1_700_000_000);
        assert!(entry.name.is_none());
    }

    #[test]
    fn dent_body_parses_name() {
        let name = b"hello.txt";
        let mut body = vec![0u8; 16 + name.len()];
        LE::write_u32(&mut body[0..4], 0o100644);
        LE::write_u32(&mut body[4..8], 42);
        LE::write_u32(&mut body[8..12], 1_700_000_000);
        LE::write_u32(&mut body[12..16], name.len() as u32);
        body[16..].copy_from_slice(name);
        let entry = parse_dent_body(&body).unwrap();
        assert_eq!(entry.name.as_deref(), Some("hello.txt"));
        assert_eq!(entry.size, 42);
    }

    #[test]
    fn truncated_dent_is_protocol_error() {
        let err = parse_dent_body(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }
}
