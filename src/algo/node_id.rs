//! 128-bit node identifiers with XOR distance, used by the Kademlia-style
//! overlays. Identities are simulation-local labels drawn from the seeded
//! run generator; there is no cryptography behind them.

use rand::Rng;

/// A 128-bit identifier, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId128(pub [u8; 16]);

impl NodeId128 {
    /// Draw a random identifier from the run generator.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        NodeId128(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// XOR distance to another identifier.
    pub fn xor(&self, other: &NodeId128) -> NodeId128 {
        let mut out = [0u8; 16];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.0[i] ^ other.0[i];
        }
        NodeId128(out)
    }

    /// Hex rendering for diagnostics.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Bucket index of an XOR distance: the position of its highest set bit
/// (`floor(log2(dist))`, bit 0 being the least significant). `None` for a
/// zero distance.
pub fn bucket_index(dist: &NodeId128) -> Option<usize> {
    for (byte_idx, &byte) in dist.0.iter().enumerate() {
        if byte != 0 {
            let bit = 7 - byte.leading_zeros() as usize;
            return Some((15 - byte_idx) * 8 + bit);
        }
    }
    None
}
