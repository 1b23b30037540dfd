use crate::config::PairingOptions;
use crate::error::{AdbError, AdbResult};
use crate::transport::Transport;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use byteorder::{ByteOrder, BE};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use std::io::{Read, Write};
use std::time::Duration;

const PAIRING_VERSION: u8 = 1;
const TYPE_SPAKE2_MSG: u8 = 0;
const TYPE_PEER_INFO: u8 = 1;
const PEER_INFO_LEN: usize = 8192;
const ADB_RSA_PUB_KEY: u8 = 0;
const EXPORT_LABEL: &[u8] = b"adb-label\0";
const GCM_TAG_LEN: usize = 16;

/// Identity used on both sides of the symmetric SPAKE2 exchange. Real
/// devices don't distinguish client/server identity here — the 6-digit
/// code is the only secret.
const SPAKE2_IDENTITY: &[u8] = b"adb pairing\0";

/// Performs the TLS-wrapped SPAKE2 pairing exchange against a device in
/// its wireless-pairing menu and submits our RSA public key, returning the
/// device's own public-key blob on success.
///
/// `Start -> Spake2Exchanged -> PeerInfoSent -> Done | Failed`: each step
/// below either advances or returns a `PairingError`, there is no retry.
pub fn pair(options: &PairingOptions) -> AdbResult<String> {
    let plain = Transport::connect(
        (options.host.as_str(), options.port),
        Some(Duration::from_secs(10)),
    )?;
    let mut transport = plain.upgrade_to_tls(&options.key)?;

    // Start -> Spake2Exchanged
    let (state, our_msg) = Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(options.pairing_code.as_bytes()),
        &Identity::new(SPAKE2_IDENTITY),
    );
    write_pairing_packet(&mut transport, TYPE_SPAKE2_MSG, &our_msg)?;
    let their_msg = read_pairing_packet(&mut transport, TYPE_SPAKE2_MSG)?;
    let shared_key = state
        .finish(&their_msg)
        .map_err(|_| AdbError::Pairing("SPAKE2 key exchange failed".into()))?;

    let tls_km = transport.export_keying_material(EXPORT_LABEL, 64)?;

    let hk = Hkdf::<Sha256>::new(None, &shared_key);
    let mut okm = [0u8; 64];
    hk.expand(&tls_km, &mut okm)
        .map_err(|_| AdbError::Pairing("HKDF expand to 64 bytes failed".into()))?;
    let aes_key = &okm[0..16];
    let nonce = &okm[32..44];

    // Spake2Exchanged -> PeerInfoSent
    let plaintext = build_peer_info(&options.key)?;
    let encrypted = encrypt_peer_info(aes_key, nonce, &plaintext)?;
    write_pairing_packet(&mut transport, TYPE_PEER_INFO, &encrypted)?;

    // PeerInfoSent -> Done | Failed
    let their_encrypted = read_pairing_packet(&mut transport, TYPE_PEER_INFO)?;
    let their_plain = decrypt_peer_info(aes_key, nonce, &their_encrypted)?;
    parse_peer_info(&their_plain)
}

fn write_pairing_packet(transport: &mut Transport, packet_type: u8, body: &[u8]) -> AdbResult<()> {
    let mut header = [0u8; 6];
    header[0] = PAIRING_VERSION;
    header[1] = packet_type;
    BE::write_u32(&mut header[2..6], body.len() as u32);
    transport.write_all(&header)?;
    transport.write_all(body)?;
    Ok(())
}

/// Pairing frames use a **big-endian** length, the one length field in the
/// whole system that isn't little-endian.
fn read_pairing_packet(transport: &mut Transport, expected_type: u8) -> AdbResult<Vec<u8>> {
    let mut header = [0u8; 6];
    transport.read_exact(&mut header)?;
    if header[0] != PAIRING_VERSION {
        return Err(AdbError::Pairing(format!(
            "unsupported pairing version {}",
            header[0]
        )));
    }
    if header[1] != expected_type {
        return Err(AdbError::Pairing(format!(
            "unexpected pairing packet type {}",
            header[1]
        )));
    }
    let len = BE::read_u32(&header[2..6]) as usize;
    let mut body = vec![0u8; len];
    transport.read_exact(&mut body)?;
    Ok(body)
}

fn build_peer_info(key: &crate::key::AdbKey) -> AdbResult<[u8; PEER_INFO_LEN]> {
    let mut blob = key.public_blob()?;
    blob.pop(); // drop the blob's own NUL, we append " name\0" below
    let text = format!("{} {}\0", blob, key.name());
    let bytes = text.as_bytes();
    if bytes.len() > PEER_INFO_LEN - 1 {
        return Err(AdbError::Pairing(
            "public key blob does not fit in a PEER_INFO packet".into(),
        ));
    }
    let mut buf = [0u8; PEER_INFO_LEN];
    buf[0] = ADB_RSA_PUB_KEY;
    buf[1..1 + bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn parse_peer_info(plain: &[u8; PEER_INFO_LEN]) -> AdbResult<String> {
    if plain[0] != ADB_RSA_PUB_KEY {
        return Err(AdbError::Pairing(format!(
            "unexpected PEER_INFO type {}",
            plain[0]
        )));
    }
    let data = &plain[1..];
    let nul = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = std::str::from_utf8(&data[..nul])
        .map_err(|_| AdbError::Pairing("malformed PEER_INFO: not valid UTF-8".into()))?;
    text.split_once(' ')
        .map(|(blob, _name)| blob.to_string())
        .ok_or_else(|| AdbError::Pairing("malformed PEER_INFO: no blob/name separator".into()))
}

/// AES-128-GCM encrypt, then rearrange the library's `ciphertext || tag`
/// output into the wire's `tag || ciphertext` framing.
fn encrypt_peer_info(
    aes_key: &[u8],
    nonce: &[u8],
    plaintext: &[u8; PEER_INFO_LEN],
) -> AdbResult<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(aes_key)
        .map_err(|e| AdbError::Pairing(format!("AES key setup failed: {}", e)))?;
    let nonce = Nonce::from_slice(nonce);
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| AdbError::Pairing(format!("AES-GCM encrypt failed: {}", e)))?;
    let tag = ciphertext.split_off(ciphertext.len() - GCM_TAG_LEN);
    let mut out = tag;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of `encrypt_peer_info`. A wrong pairing code derives the wrong
/// `aes_key`/`nonce` — SPAKE2 itself never fails, only this AEAD tag check
/// does, which is exactly how the "wrong code" testable property is meant
/// to surface.
fn decrypt_peer_info(aes_key: &[u8], nonce: &[u8], wire: &[u8]) -> AdbResult<[u8; PEER_INFO_LEN]> {
    if wire.len() != GCM_TAG_LEN + PEER_INFO_LEN {
        return Err(AdbError::Pairing("malformed PEER_INFO length".into()));
    }
    let (tag, ciphertext) = wire.split_at(GCM_TAG_LEN);
    let mut combined = Vec::with_capacity(wire.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let cipher = Aes128Gcm::new_from_slice(aes_key)
        .map_err(|e| AdbError::Pairing(format!("AES key setup failed: {}", e)))?;
    let nonce = Nonce::from_slice(nonce);
    let plain = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| AdbError::Pairing("decrypt failed".into()))?;
    if plain.len() != PEER_INFO_LEN {
        return Err(AdbError::Pairing("decrypt failed".into()));
    }
    let mut out = [0u8; PEER_INFO_LEN];
    out.copy_from_slice(&plain);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::AdbKey;

    #[test]
    fn peer_info_round_trips_through_build_and_parse() -> AdbResult<()> {
        let key = AdbKey::generate("unit-test")?;
        let buf = build_peer_info(&key)?;
        let blob = parse_peer_info(&buf)?;
        assert_eq!(blob, key.public_blob()?.trim_end_matches('\0'));
        Ok(())
    }

    #[test]
    fn aead_round_trip_with_matching_keys() {
        let aes_key = [7u8; 16];
        let nonce = [9u8; 12];
        let mut plaintext = [0u8; PEER_INFO_LEN];
        plaintext[0] = ADB_RSA_PUB_KEY;
        plaintext[1..5].copy_from_slice(b"xyzw");

        let wire = encrypt_peer_info(&aes_key, &nonce, &plaintext).unwrap();
        assert_eq!(wire.len(), GCM_TAG_LEN + PEER_INFO_LEN);
        let decrypted = decrypt_peer_info(&aes_key, &nonce, &wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aead_decrypt_fails_with_wrong_key() {
        let aes_key = [7u8; 16];
        let wrong_key = [8u8; 16];
        let nonce = [9u8; 12];
        let plaintext = [0u8; PEER_INFO_LEN];

        let wire = encrypt_peer_info(&aes_key, &nonce, &plaintext).unwrap();
        let err = decrypt_peer_info(&wrong_key, &nonce, &wire).unwrap_err();
        assert!(matches!(err, AdbError::Pairing(msg) if msg == "decrypt failed"));
    }
}
