use crate::error::{AdbError, AdbResult};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};

/// Protocol version that still carries a real payload checksum.
pub const VERSION_WITH_CHECKSUM: u32 = 0x0100_0000;
/// Protocol version where the checksum field is sent as zero and ignored.
pub const VERSION_NO_CHECKSUM: u32 = 0x0100_0001;
/// Upper bound on max_payload we advertise; the device may negotiate lower.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    Sync = 0x434e5953,
    Connect = 0x4e584e43,
    Auth = 0x48545541,
    Open = 0x4e45504f,
    Okay = 0x59414b4f,
    Close = 0x45534c43,
    Write = 0x45545257,
    Stls = 0x534c5453,
}

impl Command {
    pub fn from_u32(cmd: u32) -> Option<Self> {
        Some(match cmd {
            cmd if cmd == Self::Sync as _ => Self::Sync,
            cmd if cmd == Self::Connect as _ => Self::Connect,
            cmd if cmd == Self::Auth as _ => Self::Auth,
            cmd if cmd == Self::Open as _ => Self::Open,
            cmd if cmd == Self::Okay as _ => Self::Okay,
            cmd if cmd == Self::Close as _ => Self::Close,
            cmd if cmd == Self::Write as _ => Self::Write,
            cmd if cmd == Self::Stls as _ => Self::Stls,
            _ => return None,
        })
    }
}

fn checksum(payload: &[u8]) -> u32 {
    payload.iter().map(|&b| b as u32).sum()
}

/// One decoded ADB frame: `(command, arg0, arg1, payload)`.
#[derive(Clone, Debug)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    pub fn connect(version: u32, max_payload: u32, banner: &str) -> Self {
        let mut payload = Vec::with_capacity(banner.len() + 1);
        payload.extend_from_slice(banner.as_bytes());
        payload.push(0);
        Self::new(Command::Connect, version, max_payload, payload)
    }

    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, vec![])
    }

    pub fn write(local_id: u32, remote_id: u32, payload: Vec<u8>) -> Self {
        Self::new(Command::Write, local_id, remote_id, payload)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Close, local_id, remote_id, vec![])
    }

    pub fn encode(&self, w: &mut impl Write) -> AdbResult<()> {
        w.write_u32::<LE>(self.command as u32)?;
        w.write_u32::<LE>(self.arg0)?;
        w.write_u32::<LE>(self.arg1)?;
        w.write_u32::<LE>(self.payload.len() as u32)?;
        w.write_u32::<LE>(checksum(&self.payload))?;
        w.write_u32::<LE>(self.command as u32 ^ 0xffff_ffff)?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    /// Decode one frame. `verify_checksum` should be `true` only while
    /// talking `VERSION_WITH_CHECKSUM`; real `VERSION_NO_CHECKSUM` peers
    /// send a zeroed checksum field that must not be validated against the
    /// payload.
    pub fn decode(r: &mut impl Read, verify_checksum: bool) -> AdbResult<Self> {
        let command = r.read_u32::<LE>()?;
        let arg0 = r.read_u32::<LE>()?;
        let arg1 = r.read_u32::<LE>()?;
        let payload_length = r.read_u32::<LE>()?;
        let payload_checksum = r.read_u32::<LE>()?;
        let magic = r.read_u32::<LE>()?;
        if command ^ 0xffff_ffff != magic {
            return Err(AdbError::Protocol(format!(
                "bad magic for command 0x{:x}",
                command
            )));
        }
        let mut payload = vec![0u8; payload_length as usize];
        r.read_exact(&mut payload)?;
        if verify_checksum && checksum(&payload) != payload_checksum {
            return Err(AdbError::Protocol("payload checksum mismatch".into()));
        }
        let command = Command::from_u32(command).ok_or(AdbError::UnknownCommand(command))?;
        Ok(Self {
            command,
            arg0,
            arg1,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message, verify_checksum: bool) {
        let mut buf = vec![];
        msg.encode(&mut buf).unwrap();
        let decoded = Message::decode(&mut &buf[..], verify_checksum).unwrap();
        assert_eq!(decoded.command, msg.command);
        assert_eq!(decoded.arg0, msg.arg0);
        assert_eq!(decoded.arg1, msg.arg1);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn roundtrip_empty_payload() {
        roundtrip(&Message::okay(1, 2), true);
    }

    #[test]
    fn roundtrip_with_payload() {
        roundtrip(&Message::write(3, 4, b"hello world".to_vec()), true);
    }

    #[test]
    fn bad_checksum_rejected_in_v0() {
        let msg = Message::write(1, 2, b"abc".to_vec());
        let mut buf = vec![];
        msg.encode(&mut buf).unwrap();
        buf[16] ^= 0xff; // flip a byte of the checksum field
        let err = Message::decode(&mut &buf[..], true).unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }

    #[test]
    fn bad_checksum_ignored_in_v1() {
        let msg = Message::write(1, 2, b"abc".to_vec());
        let mut buf = vec![];
        msg.encode(&mut buf).unwrap();
        buf[16] ^= 0xff;
        let decoded = Message::decode(&mut &buf[..], false).unwrap();
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn unknown_command_rejected() {
        // magic must still be consistent, or the magic check fires first.
        let mut buf = vec![];
        buf.write_u32::<LE>(0x1234_5678).unwrap();
        buf.write_u32::<LE>(0).unwrap();
        buf.write_u32::<LE>(0).unwrap();
        buf.write_u32::<LE>(0).unwrap();
        buf.write_u32::<LE>(0).unwrap();
        buf.write_u32::<LE>(0x1234_5678 ^ 0xffff_ffff).unwrap();
        let err = Message::decode(&mut &buf[..], true).unwrap_err();
        assert!(matches!(err, AdbError::UnknownCommand(_)));
    }
}
