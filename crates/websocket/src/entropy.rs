//! Randomness collaborator: handshake nonces and per-frame masking keys.

/// Source of the unpredictable bytes the protocol needs.
///
/// Injected at construction so tests can replay a fixed sequence.
pub trait Entropy: Send {
    /// 16 random bytes for `Sec-WebSocket-Key`; must be unguessable.
    fn nonce(&mut self) -> [u8; 16];
    /// A fresh 32-bit masking key for one client frame.
    fn mask_key(&mut self) -> [u8; 4];
}

/// Draws from `rand`'s thread-local CSPRNG (seeded from the OS).
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadEntropy;

impl Entropy for ThreadEntropy {
    fn nonce(&mut self) -> [u8; 16] {
        rand::random()
    }

    fn mask_key(&mut self) -> [u8; 4] {
        rand::random()
    }
}

/// Replays a fixed byte sequence, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct FixedEntropy {
    bytes: Vec<u8>,
    pos: usize,
}

impl FixedEntropy {
    /// An empty sequence yields zeros.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        FixedEntropy {
            bytes: bytes.into(),
            pos: 0,
        }
    }

    fn fill(&mut self, out: &mut [u8]) {
        for slot in out.iter_mut() {
            *slot = self.bytes.get(self.pos).copied().unwrap_or(0);
            self.pos += 1;
            if self.pos >= self.bytes.len() {
                self.pos = 0;
            }
        }
    }
}

impl Entropy for FixedEntropy {
    fn nonce(&mut self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.fill(&mut out);
        out
    }

    fn mask_key(&mut self) -> [u8; 4] {
        let mut out = [0u8; 4];
        self.fill(&mut out);
        out
    }
}
