//! Worker hello: the 12-byte handshake a worker sends on the local channel.
//!
//! ```text
//!  0               8           12
//!  +---------------+-----------+
//!  |  "RUSTICA!"   | worker id |
//!  +---------------+-----------+
//!                    u32, native byte order
//! ```
//!
//! The broker may receive the hello split across any number of reads, so
//! [`HelloReader`] consumes it incrementally and rejects it at the first byte
//! that disagrees with the magic token.

/// Magic token opening every hello.
pub const HELLO_MAGIC: &[u8; 8] = b"RUSTICA!";

/// Total hello length: magic plus a 4-byte worker id.
pub const HELLO_LEN: usize = HELLO_MAGIC.len() + 4;

/// Encode the hello a worker sends right after connecting.
pub fn encode(worker_id: u32) -> [u8; HELLO_LEN] {
    let mut hello = [0u8; HELLO_LEN];
    hello[..HELLO_MAGIC.len()].copy_from_slice(HELLO_MAGIC);
    hello[HELLO_MAGIC.len()..].copy_from_slice(&worker_id.to_ne_bytes());
    hello
}

/// Outcome of feeding bytes to a [`HelloReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloStep {
    /// More bytes are needed.
    Partial,
    /// All 12 bytes arrived and the magic matched.
    Complete(u32),
    /// The byte at `offset` did not match the magic token.
    Rejected { offset: usize },
}

/// Incremental hello parser kept in each worker slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloReader {
    progress: usize,
    id: [u8; 4],
}

impl HelloReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the hello received so far (0..=12).
    pub fn progress(&self) -> usize {
        self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= HELLO_LEN
    }

    /// How many more bytes the next receive may ask for.
    pub fn remaining(&self) -> usize {
        HELLO_LEN.saturating_sub(self.progress)
    }

    /// The decoded worker id, once the hello is complete.
    pub fn worker_id(&self) -> Option<u32> {
        self.is_complete().then(|| u32::from_ne_bytes(self.id))
    }

    /// Consume freshly received bytes.
    ///
    /// `bytes` must not be longer than [`remaining`](Self::remaining). An empty
    /// slice is valid and leaves the reader partial.
    pub fn feed(&mut self, bytes: &[u8]) -> HelloStep {
        debug_assert!(bytes.len() <= self.remaining());
        let magic_len = HELLO_MAGIC.len();

        for (i, &byte) in bytes.iter().enumerate() {
            let offset = self.progress + i;
            if offset < magic_len {
                if byte != HELLO_MAGIC[offset] {
                    return HelloStep::Rejected { offset };
                }
            } else {
                self.id[offset - magic_len] = byte;
            }
        }
        self.progress += bytes.len();

        match self.worker_id() {
            Some(id) => HelloStep::Complete(id),
            None => HelloStep::Partial,
        }
    }

    /// Forget a previous hello so the worker can announce itself again.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let hello = encode(42);
        assert_eq!(&hello[..8], b"RUSTICA!");
        assert_eq!(&hello[8..], &42u32.to_ne_bytes());
    }

    #[test]
    fn test_three_writes() {
        let mut reader = HelloReader::new();
        assert_eq!(reader.feed(b"RUST"), HelloStep::Partial);
        assert_eq!(reader.feed(b"ICA!"), HelloStep::Partial);
        assert_eq!(reader.progress(), 8);
        assert_eq!(reader.feed(&42u32.to_ne_bytes()), HelloStep::Complete(42));
        assert_eq!(reader.worker_id(), Some(42));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_empty_feed_keeps_progress() {
        let mut reader = HelloReader::new();
        reader.feed(b"RUS");
        assert_eq!(reader.feed(&[]), HelloStep::Partial);
        assert_eq!(reader.progress(), 3);
    }

    #[test]
    fn test_first_byte_mismatch() {
        let mut reader = HelloReader::new();
        assert_eq!(
            reader.feed(b"XUSTICA!"),
            HelloStep::Rejected { offset: 0 }
        );
    }

    #[test]
    fn test_mismatch_in_later_chunk() {
        let mut reader = HelloReader::new();
        assert_eq!(reader.feed(b"RUSTI"), HelloStep::Partial);
        assert_eq!(reader.feed(b"Cx"), HelloStep::Rejected { offset: 6 });
    }

    #[test]
    fn test_id_bytes_are_not_checked_against_magic() {
        let mut reader = HelloReader::new();
        let id = u32::from_ne_bytes(*b"RUST");
        assert_eq!(reader.feed(&encode(id)), HelloStep::Complete(id));
    }

    #[test]
    fn test_reset() {
        let mut reader = HelloReader::new();
        reader.feed(&encode(7));
        assert!(reader.is_complete());
        reader.reset();
        assert_eq!(reader.progress(), 0);
        assert_eq!(reader.worker_id(), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Split `bytes` at the given cut points (deduplicated, sorted).
    fn chunks(bytes: &[u8], mut cuts: Vec<usize>) -> Vec<&[u8]> {
        cuts.retain(|&c| c > 0 && c < bytes.len());
        cuts.sort_unstable();
        cuts.dedup();
        let mut out = Vec::new();
        let mut start = 0;
        for cut in cuts {
            out.push(&bytes[start..cut]);
            start = cut;
        }
        out.push(&bytes[start..]);
        out
    }

    proptest! {
        /// However the hello is split, the reader completes exactly once, on
        /// the last chunk, with the encoded id.
        #[test]
        fn split_hello_completes_once(
            id in any::<u32>(),
            cuts in prop::collection::vec(1usize..HELLO_LEN, 0..12),
        ) {
            let hello = encode(id);
            let parts = chunks(&hello, cuts);
            let mut reader = HelloReader::new();
            let mut completions = 0;
            for (i, part) in parts.iter().enumerate() {
                match reader.feed(part) {
                    HelloStep::Complete(got) => {
                        prop_assert_eq!(got, id);
                        prop_assert_eq!(i, parts.len() - 1);
                        completions += 1;
                    }
                    HelloStep::Partial => {}
                    HelloStep::Rejected { .. } => prop_assert!(false, "valid hello rejected"),
                }
            }
            prop_assert_eq!(completions, 1);
        }

        /// A wrong magic byte is reported in the chunk that carries it.
        #[test]
        fn bad_magic_rejected_in_its_chunk(
            k in 0usize..HELLO_MAGIC.len(),
            wrong in any::<u8>(),
            id in any::<u32>(),
            cuts in prop::collection::vec(1usize..HELLO_LEN, 0..12),
        ) {
            prop_assume!(wrong != HELLO_MAGIC[k]);
            let mut hello = encode(id);
            hello[k] = wrong;
            let parts = chunks(&hello, cuts);

            let mut reader = HelloReader::new();
            let mut start = 0;
            for part in parts {
                let end = start + part.len();
                let step = reader.feed(part);
                if (start..end).contains(&k) {
                    prop_assert_eq!(step, HelloStep::Rejected { offset: k });
                    return Ok(());
                }
                prop_assert_eq!(step, HelloStep::Partial);
                start = end;
            }
            prop_assert!(false, "mismatch never reported");
        }
    }
}
