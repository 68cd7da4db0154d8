// SPDX-License-Identifier: Apache-2.0

//! The interface a replicated service implements, and a minimal echo service used by
//! this crate's own integration tests.

/// The state machine an SMR deployment replicates. `execute` is called once per
/// decided request, in instance order; `digest` summarizes everything applied so far
/// and is what gets checkpointed into consensus.
pub trait ApplicationState: Send {
    fn execute(&mut self, payload: &[u8]) -> Vec<u8>;
    fn digest(&self) -> [u8; 32];
}

/// Echoes every request back as its own response, folding each payload into a running
/// hash for the checkpoint digest.
pub struct EchoApp {
    hasher: blake3::Hasher,
}

impl EchoApp {
    pub fn new() -> Self {
        Self { hasher: blake3::Hasher::new() }
    }
}

impl Default for EchoApp {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationState for EchoApp {
    fn execute(&mut self, payload: &[u8]) -> Vec<u8> {
        self.hasher.update(payload);
        payload.to_vec()
    }

    fn digest(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_returns_the_same_payload() {
        let mut app = EchoApp::new();
        assert_eq!(app.execute(b"hello"), b"hello".to_vec());
    }

    #[test]
    fn digest_changes_with_every_execution() {
        let mut app = EchoApp::new();
        let d0 = app.digest();
        app.execute(b"a");
        let d1 = app.digest();
        app.execute(b"b");
        let d2 = app.digest();
        assert_ne!(d0, d1);
        assert_ne!(d1, d2);
    }
}
