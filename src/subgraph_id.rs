//! Subgraph identifiers: bit-exact conversion between the IPFS-style
//! base58 representation (`Qm...`, 46 characters) used at the indexer-agent
//! boundary and the 32-byte hex representation (`0x` + 64 lowercase hex
//! digits) used as the Postgres `char(46)`-adjacent key and in
//! `costModel(deployment: "0x...")` queries.
//!
//! An IPFS v0 CID is a multihash: a 2-byte prefix (`0x1220`, sha2-256 /
//! length 32) followed by the 32-byte digest, base58-encoded. Dropping the
//! prefix and hex-encoding the remaining 32 bytes gives the hex form; the
//! reverse prepends `1220` and base58-encodes.

use std::fmt;

use serde::{Deserialize, Serialize};

const MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubgraphId(String);

#[derive(Debug, thiserror::Error)]
pub enum SubgraphIdError {
    #[error("invalid base58 ipfs hash: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("invalid hex digest: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("decoded ipfs hash has {0} bytes, expected 34 (2-byte multihash prefix + 32-byte digest)")]
    WrongLength(usize),
    #[error("hex digest has {0} bytes, expected 32")]
    WrongHexLength(usize),
    #[error("hex string missing `0x` prefix")]
    MissingPrefix,
}

impl SubgraphId {
    /// Construct from the 46-character base58 `Qm...` form, as returned by
    /// the indexer-agent's `indexerAllocations` query.
    pub fn from_ipfs(ipfs: &str) -> Result<Self, SubgraphIdError> {
        // Round-trip through hex to validate shape; store the canonical
        // ipfs form since that's what most of the system speaks.
        let _ = Self::ipfs_to_hex(ipfs)?;
        Ok(SubgraphId(ipfs.to_string()))
    }

    /// Construct from the `0x`-prefixed 64-hex-digit form.
    pub fn from_hex(hex_str: &str) -> Result<Self, SubgraphIdError> {
        let ipfs = Self::hex_to_ipfs(hex_str)?;
        Ok(SubgraphId(ipfs))
    }

    pub fn as_ipfs(&self) -> &str {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        // Validity was checked at construction time.
        Self::ipfs_to_hex(&self.0).expect("SubgraphId invariant: stored form is valid ipfs hash")
    }

    fn ipfs_to_hex(ipfs: &str) -> Result<String, SubgraphIdError> {
        let decoded = bs58::decode(ipfs).into_vec()?;
        if decoded.len() != 34 {
            return Err(SubgraphIdError::WrongLength(decoded.len()));
        }
        Ok(format!("0x{}", hex::encode(&decoded[2..])))
    }

    fn hex_to_ipfs(hex_str: &str) -> Result<String, SubgraphIdError> {
        let stripped = hex_str.strip_prefix("0x").ok_or(SubgraphIdError::MissingPrefix)?;
        let digest = hex::decode(stripped)?;
        if digest.len() != 32 {
            return Err(SubgraphIdError::WrongHexLength(digest.len()));
        }
        let mut payload = Vec::with_capacity(34);
        payload.extend_from_slice(&MULTIHASH_PREFIX);
        payload.extend_from_slice(&digest);
        Ok(bs58::encode(payload).into_string())
    }
}

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ipfs_to_hex_and_back() {
        let ipfs = "Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K";
        let id = SubgraphId::from_ipfs(ipfs).unwrap();
        assert_eq!(
            id.to_hex(),
            "0xbbde25a2c85f55b53b7698b9476610c3d1202d88870e66502ab0076b7218f98a"
        );
        let back = SubgraphId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(back.as_ipfs(), ipfs);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(SubgraphId::from_hex("deadbeef").is_err());
        assert!(SubgraphId::from_hex("0xzz").is_err());
    }

    #[test]
    fn rejects_malformed_base58() {
        assert!(SubgraphId::from_ipfs("not-a-valid-ipfs-hash").is_err());
    }
}
