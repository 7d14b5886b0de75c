use sha1::{Digest, Sha1};

/// Length of a unit content hash in bytes (SHA-1).
pub const UNIT_HASH_LEN: usize = 20;

/// A unit digest: 20 bytes of SHA-1.
pub type UnitHash = [u8; UNIT_HASH_LEN];

/// Computes the 20-byte content hash of a byte sequence.
pub fn sha1_digest(bytes: &[u8]) -> UnitHash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Renders a digest as lowercase hex, the form used in artifact filenames.
pub fn hex_digest(digest: &UnitHash) -> String {
    let mut out = String::with_capacity(UNIT_HASH_LEN * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// An immutable fuzz input: a byte sequence plus its content hash,
/// computed once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    bytes: Vec<u8>,
    hash: UnitHash,
}

impl Unit {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = sha1_digest(&bytes);
        Self { bytes, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> &UnitHash {
        &self.hash
    }

    pub fn hex_id(&self) -> String {
        hex_digest(&self.hash)
    }
}

impl From<Vec<u8>> for Unit {
    fn from(bytes: Vec<u8>) -> Self {
        Unit::new(bytes)
    }
}

/// True if every byte is 7-bit ASCII.
pub fn is_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii())
}

/// Forces a buffer into printable ASCII: each byte is masked to 7 bits and
/// non-printable, non-space bytes are replaced with '.'.
pub fn to_ascii(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        *byte &= 0x7f;
        if !byte.is_ascii_graphic() && !byte.is_ascii_whitespace() {
            *byte = b'.';
        }
    }
}
