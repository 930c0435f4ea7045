//! Fragment codec for BLE transmission
//!
//! Splits signed transaction bytes into MTU-sized fragments with a fixed
//! binary header and CRC-16 payload checksum, and reconstructs them on the
//! receiving side. The wire layout is stable across versions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Wire magic, little-endian ("SM" on the wire)
pub const FRAGMENT_MAGIC: u16 = 0x4D53;

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size before the payload (bytes)
pub const HEADER_LEN: usize = 44;

/// Maximum payload size per fragment (bytes)
pub const MAX_PAYLOAD: usize = 480;

/// Maximum fragments per transaction
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Transaction identifier: SHA-256 of the full transmitted bytes
pub type TxId = [u8; 32];

/// Compute the transaction ID for a byte payload
pub fn tx_id(bytes: &[u8]) -> TxId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Short hex rendering of a transaction ID for logs
pub fn short_id(id: &TxId) -> String {
    hex::encode(&id[..4])
}

/// Fragment payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FragmentType {
    /// Transaction bytes
    Data = 0,
    /// Control payloads (confirmations relayed back through the mesh)
    Control = 1,
}

impl FragmentType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FragmentType::Data),
            1 => Some(FragmentType::Control),
            _ => None,
        }
    }
}

/// One BLE-sized slice of a transaction plus its header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// SHA-256 of the complete payload being transported
    pub tx_id: TxId,
    /// Fragment index, 0-based
    pub index: u16,
    /// Total number of fragments, at least 1
    pub total: u16,
    /// Payload kind
    pub fragment_type: FragmentType,
    /// Fragment payload
    pub payload: Vec<u8>,
    /// CRC-16/CCITT-FALSE over the payload
    pub checksum: u16,
}

impl Fragment {
    /// Recompute the payload checksum and compare against the stored one
    pub fn verify_checksum(&self) -> bool {
        crc16(&self.payload) == self.checksum
    }
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection, no xorout.
/// Two bytes is all the wire budget allows; the end-to-end SHA-256 check in
/// `join` catches anything the CRC misses.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Codec errors
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("payload of {len} bytes needs {needed} fragments, cap is {max}")]
    TooLarge {
        len: usize,
        needed: usize,
        max: usize,
    },

    #[error("malformed fragment: {0}")]
    Malformed(String),

    #[error("checksum mismatch on fragment {index}")]
    ChecksumMismatch { index: u16 },

    #[error("fragment total mismatch: expected {expected}, got {got}")]
    TotalMismatch { expected: u16, got: u16 },

    #[error("missing fragment indices: {0:?}")]
    MissingFragments(Vec<u16>),

    #[error("reassembled bytes do not hash to the fragment transaction ID")]
    HashMismatch,
}

/// Split a byte payload into data fragments sized for the current MTU.
///
/// Every fragment carries the same `tx_id` (SHA-256 of `bytes`) and `total`.
/// The last fragment may be shorter. Empty input yields a single empty
/// fragment so zero-length payloads still round-trip.
pub fn fragment(bytes: &[u8], max_payload: usize) -> Result<Vec<Fragment>, CodecError> {
    fragment_typed(bytes, max_payload, FragmentType::Data)
}

/// Split a byte payload into fragments of the given kind
pub fn fragment_typed(
    bytes: &[u8],
    max_payload: usize,
    fragment_type: FragmentType,
) -> Result<Vec<Fragment>, CodecError> {
    let max_payload = max_payload.clamp(1, MAX_PAYLOAD);
    let id = tx_id(bytes);

    let total = if bytes.is_empty() {
        1
    } else {
        (bytes.len() + max_payload - 1) / max_payload
    };

    if total > MAX_FRAGMENTS {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            needed: total,
            max: MAX_FRAGMENTS,
        });
    }

    let mut fragments = Vec::with_capacity(total);
    if bytes.is_empty() {
        fragments.push(Fragment {
            tx_id: id,
            index: 0,
            total: 1,
            fragment_type,
            payload: Vec::new(),
            checksum: crc16(&[]),
        });
    } else {
        for (index, chunk) in bytes.chunks(max_payload).enumerate() {
            fragments.push(Fragment {
                tx_id: id,
                index: index as u16,
                total: total as u16,
                fragment_type,
                payload: chunk.to_vec(),
                checksum: crc16(chunk),
            });
        }
    }

    tracing::debug!(
        "fragmented {} bytes into {} fragments (max_payload {})",
        bytes.len(),
        fragments.len(),
        max_payload
    );

    Ok(fragments)
}

/// Encode a fragment into its wire form: fixed 44-byte little-endian header
/// followed by the payload.
pub fn encode(fragment: &Fragment) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + fragment.payload.len());
    bytes.extend_from_slice(&FRAGMENT_MAGIC.to_le_bytes());
    bytes.push(WIRE_VERSION);
    bytes.push(fragment.fragment_type as u8);
    bytes.extend_from_slice(&fragment.tx_id);
    bytes.extend_from_slice(&fragment.index.to_le_bytes());
    bytes.extend_from_slice(&fragment.total.to_le_bytes());
    bytes.extend_from_slice(&(fragment.payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&fragment.checksum.to_le_bytes());
    bytes.extend_from_slice(&fragment.payload);
    bytes
}

/// Decode a wire frame back into a fragment.
///
/// Validates magic, version, bounds, and the payload checksum. Trailing bytes
/// beyond `payload_len` are tolerated so padded BLE frames still parse.
pub fn decode(bytes: &[u8]) -> Result<Fragment, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }

    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != FRAGMENT_MAGIC {
        return Err(CodecError::Malformed(format!("bad magic 0x{magic:04X}")));
    }
    if bytes[2] != WIRE_VERSION {
        return Err(CodecError::Malformed(format!(
            "unsupported wire version {}",
            bytes[2]
        )));
    }
    let fragment_type = FragmentType::from_u8(bytes[3])
        .ok_or_else(|| CodecError::Malformed(format!("unknown fragment type {}", bytes[3])))?;

    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes[4..36]);

    let index = u16::from_le_bytes([bytes[36], bytes[37]]);
    let total = u16::from_le_bytes([bytes[38], bytes[39]]);
    let payload_len = u16::from_le_bytes([bytes[40], bytes[41]]) as usize;
    let checksum = u16::from_le_bytes([bytes[42], bytes[43]]);

    if total == 0 {
        return Err(CodecError::Malformed("total of zero".into()));
    }
    if index >= total {
        return Err(CodecError::Malformed(format!(
            "index {index} out of range (total {total})"
        )));
    }
    if payload_len > MAX_PAYLOAD {
        return Err(CodecError::Malformed(format!(
            "payload length {payload_len} exceeds cap {MAX_PAYLOAD}"
        )));
    }
    if bytes.len() < HEADER_LEN + payload_len {
        return Err(CodecError::Malformed(format!(
            "payload truncated: header claims {} bytes, frame has {}",
            payload_len,
            bytes.len() - HEADER_LEN
        )));
    }

    let payload = bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    if crc16(&payload) != checksum {
        return Err(CodecError::ChecksumMismatch { index });
    }

    Ok(Fragment {
        tx_id: id,
        index,
        total,
        fragment_type,
        payload,
        checksum,
    })
}

/// Reconstruct the original bytes from a complete fragment set.
///
/// Fragments may arrive in any order. The reassembled bytes must hash back to
/// the shared `tx_id`.
pub fn join(fragments: &[Fragment]) -> Result<Vec<u8>, CodecError> {
    let first = fragments
        .first()
        .ok_or_else(|| CodecError::Malformed("no fragments provided".into()))?;
    let id = first.tx_id;
    let total = first.total;

    for fragment in fragments {
        if fragment.tx_id != id {
            return Err(CodecError::Malformed("transaction ID mismatch".into()));
        }
        if fragment.total != total {
            return Err(CodecError::TotalMismatch {
                expected: total,
                got: fragment.total,
            });
        }
    }

    let mut slots: Vec<Option<&Fragment>> = vec![None; total as usize];
    for fragment in fragments {
        if (fragment.index as usize) < slots.len() {
            slots[fragment.index as usize] = Some(fragment);
        }
    }

    let missing: Vec<u16> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(i, _)| i as u16)
        .collect();
    if !missing.is_empty() {
        return Err(CodecError::MissingFragments(missing));
    }

    let mut bytes = Vec::new();
    for fragment in slots.into_iter().flatten() {
        bytes.extend_from_slice(&fragment.payload);
    }

    if tx_id(&bytes) != id {
        return Err(CodecError::HashMismatch);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_small_payload() {
        let bytes = vec![7u8; 200];
        let fragments = fragment(&bytes, MAX_PAYLOAD).unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].index, 0);
        assert_eq!(fragments[0].total, 1);
        assert_eq!(fragments[0].payload.len(), 200);
        assert_eq!(fragments[0].tx_id, tx_id(&bytes));
    }

    #[test]
    fn test_fragment_101_bytes_at_30() {
        // 101 bytes at 30 per fragment: 30, 30, 30, 11
        let bytes: Vec<u8> = (0..101).collect();
        let fragments = fragment(&bytes, 30).unwrap();

        assert_eq!(fragments.len(), 4);
        let lens: Vec<usize> = fragments.iter().map(|f| f.payload.len()).collect();
        assert_eq!(lens, vec![30, 30, 30, 11]);

        let id = tx_id(&bytes);
        for f in &fragments {
            assert_eq!(f.tx_id, id);
            assert_eq!(f.total, 4);
            assert!(f.verify_checksum());
        }
    }

    #[test]
    fn test_fragment_empty_payload() {
        let fragments = fragment(&[], 100).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].payload.is_empty());
        assert_eq!(join(&fragments).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_fragment_too_large() {
        // 1-byte payloads force one fragment per byte
        let bytes = vec![0u8; MAX_FRAGMENTS + 1];
        let result = fragment(&bytes, 1);
        assert!(matches!(result, Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let bytes = vec![42u8; 1000];
        let fragments = fragment(&bytes, 100).unwrap();

        for original in &fragments {
            let wire = encode(original);
            assert_eq!(wire.len(), HEADER_LEN + original.payload.len());
            let decoded = decode(&wire).unwrap();
            assert_eq!(&decoded, original);
        }
    }

    #[test]
    fn test_decode_tolerates_trailing_padding() {
        let fragments = fragment(&[1, 2, 3], 100).unwrap();
        let mut wire = encode(&fragments[0]);
        wire.extend_from_slice(&[0u8; 16]);
        assert_eq!(decode(&wire).unwrap(), fragments[0]);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let fragments = fragment(&[1, 2, 3], 100).unwrap();
        let mut wire = encode(&fragments[0]);
        wire[0] ^= 0xFF;
        assert!(matches!(decode(&wire), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let fragments = fragment(&[1, 2, 3], 100).unwrap();
        let mut wire = encode(&fragments[0]);
        wire[2] = 99;
        assert!(matches!(decode(&wire), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_corrupted_payload() {
        let fragments = fragment(&[1, 2, 3, 4, 5], 100).unwrap();
        let mut wire = encode(&fragments[0]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(matches!(
            decode(&wire),
            Err(CodecError::ChecksumMismatch { index: 0 })
        ));
    }

    #[test]
    fn test_decode_rejects_oversize_payload_len() {
        let fragments = fragment(&[1, 2, 3], 100).unwrap();
        let mut wire = encode(&fragments[0]);
        let claimed = (MAX_PAYLOAD as u16 + 1).to_le_bytes();
        wire[40] = claimed[0];
        wire[41] = claimed[1];
        assert!(matches!(decode(&wire), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        assert!(matches!(
            decode(&[0u8; HEADER_LEN - 1]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_join_out_of_order() {
        let bytes: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        let mut fragments = fragment(&bytes, 64).unwrap();
        fragments.reverse();
        assert_eq!(join(&fragments).unwrap(), bytes);
    }

    #[test]
    fn test_join_missing_fragment() {
        let bytes = vec![9u8; 500];
        let mut fragments = fragment(&bytes, 100).unwrap();
        fragments.remove(2);
        assert!(matches!(
            join(&fragments),
            Err(CodecError::MissingFragments(missing)) if missing == vec![2]
        ));
    }

    #[test]
    fn test_join_detects_tampered_payload() {
        let bytes = vec![5u8; 300];
        let mut fragments = fragment(&bytes, 100).unwrap();
        fragments[1].payload[0] ^= 0xFF;
        fragments[1].checksum = crc16(&fragments[1].payload);
        assert!(matches!(join(&fragments), Err(CodecError::HashMismatch)));
    }

    #[test]
    fn test_round_trip_across_mtu_range() {
        let bytes: Vec<u8> = (0..1232).map(|i| (i * 7 % 256) as u8).collect();
        for max_payload in [20, 61, 128, 244, MAX_PAYLOAD] {
            let fragments = fragment(&bytes, max_payload).unwrap();
            assert_eq!(join(&fragments).unwrap(), bytes, "mtu {max_payload}");
        }
    }

    #[test]
    fn test_crc16_known_vector() {
        // Standard CRC-16/CCITT-FALSE check value for "123456789"
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_control_fragment_type_survives_wire() {
        let fragments = fragment_typed(b"confirmation", 100, FragmentType::Control).unwrap();
        let decoded = decode(&encode(&fragments[0])).unwrap();
        assert_eq!(decoded.fragment_type, FragmentType::Control);
    }
}
