//! secp256k1 ECDSA verification for LNURL-auth.
//!
//! Wallets sign `k1` directly: the 32 challenge bytes are the digest, nothing
//! is hashed first. Signatures arrive DER-encoded and are unpacked into the
//! 64-byte compact form before verification.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use thiserror::Error;
use tracing::debug;

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not a DER sequence")]
    NotSequence,
    #[error("signature truncated")]
    Truncated,
    #[error("unsupported DER length encoding")]
    LongFormLength,
    #[error("expected DER integer")]
    NotInteger,
    #[error("empty DER integer")]
    EmptyInteger,
    #[error("integer longer than 32 bytes")]
    IntegerTooLong,
    #[error("trailing bytes after signature")]
    TrailingBytes,
}

/// Verify a DER-encoded signature over `challenge` with a 33 or 65 byte key.
pub fn verify(challenge: &[u8; 32], signature: &[u8], pubkey: &[u8]) -> bool {
    match parse_der(signature) {
        Ok(raw) => verify_raw(challenge, &raw, pubkey),
        Err(e) => {
            debug!("rejecting signature: {e}");
            false
        }
    }
}

/// Verify a compact `r || s` signature. High-S values are normalized first.
pub fn verify_raw(challenge: &[u8; 32], raw: &[u8; 64], pubkey: &[u8]) -> bool {
    let pk = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(e) => {
            debug!("rejecting pubkey: {e}");
            return false;
        }
    };
    let mut sig = match Signature::from_compact(raw) {
        Ok(sig) => sig,
        Err(e) => {
            debug!("rejecting signature scalars: {e}");
            return false;
        }
    };
    sig.normalize_s();

    let msg = Message::from_digest(*challenge);
    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig, &pk)
        .is_ok()
}

/// Decode `0x30 len 0x02 rlen r 0x02 slen s` into `r || s`, each left-padded
/// to 32 bytes. Every length prefix is checked against the remaining buffer.
pub fn parse_der(sig: &[u8]) -> Result<[u8; 64], SignatureError> {
    let (&tag, rest) = sig.split_first().ok_or(SignatureError::Truncated)?;
    if tag != SEQUENCE_TAG {
        return Err(SignatureError::NotSequence);
    }
    let (body, trailing) = read_length_prefixed(rest)?;
    if !trailing.is_empty() {
        return Err(SignatureError::TrailingBytes);
    }

    let (r, body) = read_integer(body)?;
    let (s, body) = read_integer(body)?;
    if !body.is_empty() {
        return Err(SignatureError::TrailingBytes);
    }

    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(&to_scalar(r)?);
    raw[32..].copy_from_slice(&to_scalar(s)?);
    Ok(raw)
}

fn read_length_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), SignatureError> {
    let (&len, rest) = buf.split_first().ok_or(SignatureError::Truncated)?;
    // ECDSA signatures never exceed 72 bytes, so only the short form is valid.
    if len & 0x80 != 0 {
        return Err(SignatureError::LongFormLength);
    }
    let len = len as usize;
    if len > rest.len() {
        return Err(SignatureError::Truncated);
    }
    Ok(rest.split_at(len))
}

fn read_integer(buf: &[u8]) -> Result<(&[u8], &[u8]), SignatureError> {
    let (&tag, rest) = buf.split_first().ok_or(SignatureError::Truncated)?;
    if tag != INTEGER_TAG {
        return Err(SignatureError::NotInteger);
    }
    let (int, rest) = read_length_prefixed(rest)?;
    if int.is_empty() {
        return Err(SignatureError::EmptyInteger);
    }
    Ok((int, rest))
}

fn to_scalar(int: &[u8]) -> Result<[u8; 32], SignatureError> {
    let start = int.iter().position(|&b| b != 0).unwrap_or(int.len());
    let digits = &int[start..];
    if digits.len() > 32 {
        return Err(SignatureError::IntegerTooLong);
    }
    let mut out = [0u8; 32];
    out[32 - digits.len()..].copy_from_slice(digits);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{constants::CURVE_ORDER, SecretKey};

    const K1: [u8; 32] = [0x5a; 32];

    fn keypair() -> (Secp256k1<secp256k1::All>, SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (secp, sk, pk)
    }

    fn sign(k1: &[u8; 32]) -> (Signature, PublicKey) {
        let (secp, sk, pk) = keypair();
        (secp.sign_ecdsa(&Message::from_digest(*k1), &sk), pk)
    }

    #[test]
    fn der_signature_verifies_with_compressed_key() {
        let (sig, pk) = sign(&K1);
        assert!(verify(&K1, &sig.serialize_der(), &pk.serialize()));
    }

    #[test]
    fn der_signature_verifies_with_uncompressed_key() {
        let (sig, pk) = sign(&K1);
        assert!(verify(&K1, &sig.serialize_der(), &pk.serialize_uncompressed()));
    }

    #[test]
    fn challenge_is_not_hashed_before_verification() {
        let (sig, pk) = sign(&K1);
        let mut other = K1;
        other[0] ^= 1;
        assert!(!verify(&other, &sig.serialize_der(), &pk.serialize()));
    }

    #[test]
    fn wrong_key_fails() {
        let (sig, _) = sign(&K1);
        let secp = Secp256k1::new();
        let other = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x07; 32]).unwrap());
        assert!(!verify(&K1, &sig.serialize_der(), &other.serialize()));
    }

    #[test]
    fn invalid_pubkey_fails() {
        let (sig, _) = sign(&K1);
        assert!(!verify(&K1, &sig.serialize_der(), &[0x02; 33]));
        assert!(!verify(&K1, &sig.serialize_der(), &[0x02; 10]));
    }

    #[test]
    fn compact_signature_rejected_by_der_path() {
        let (sig, pk) = sign(&K1);
        let compact = sig.serialize_compact();
        assert!(verify_raw(&K1, &compact, &pk.serialize()));
        if compact[0] != SEQUENCE_TAG {
            assert!(!verify(&K1, &compact, &pk.serialize()));
        }
    }

    #[test]
    fn high_s_signature_is_accepted() {
        let (sig, pk) = sign(&K1);
        let mut raw = sig.serialize_compact();

        // s' = n - s
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let d = CURVE_ORDER[i] as i16 - raw[32 + i] as i16 - borrow;
            raw[32 + i] = d.rem_euclid(256) as u8;
            borrow = if d < 0 { 1 } else { 0 };
        }

        let high_s = Signature::from_compact(&raw).unwrap();
        assert!(verify(&K1, &high_s.serialize_der(), &pk.serialize()));
    }

    #[test]
    fn der_round_trip_normalizes_scalars() {
        let mut raw = [0u8; 64];
        // r with leading zero bytes, s with the high bit set (DER adds 0x00)
        raw[2] = 0x7f;
        raw[31] = 0x01;
        raw[32] = 0x80;
        raw[63] = 0x02;
        let der = Signature::from_compact(&raw).unwrap().serialize_der();
        assert_eq!(parse_der(&der).unwrap(), raw);
    }

    #[test]
    fn der_round_trip_of_real_signature() {
        let (sig, _) = sign(&K1);
        assert_eq!(parse_der(&sig.serialize_der()).unwrap(), sig.serialize_compact());
    }

    #[test]
    fn malformed_der_is_rejected() {
        assert_eq!(parse_der(&[]), Err(SignatureError::Truncated));
        assert_eq!(parse_der(&[0x31, 0x00]), Err(SignatureError::NotSequence));
        assert_eq!(parse_der(&[0x30, 0x10, 0x02]), Err(SignatureError::Truncated));
        assert_eq!(parse_der(&[0x30, 0x81, 0x02]), Err(SignatureError::LongFormLength));
        assert_eq!(
            parse_der(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x03, 0x01, 0x01]),
            Err(SignatureError::NotInteger)
        );
        assert_eq!(
            parse_der(&[0x30, 0x05, 0x02, 0x00, 0x02, 0x01, 0x01]),
            Err(SignatureError::EmptyInteger)
        );
        // r claims more bytes than the sequence holds
        assert_eq!(
            parse_der(&[0x30, 0x06, 0x02, 0x09, 0x01, 0x02, 0x01, 0x01]),
            Err(SignatureError::Truncated)
        );
        assert_eq!(
            parse_der(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0xff]),
            Err(SignatureError::TrailingBytes)
        );
    }

    #[test]
    fn oversized_integer_is_rejected() {
        let mut der = vec![0x30, 2 + 33 + 3, 0x02, 33];
        der.extend(std::iter::repeat(0x11).take(33));
        der.extend([0x02, 0x01, 0x01]);
        assert_eq!(parse_der(&der), Err(SignatureError::IntegerTooLong));
    }
}
