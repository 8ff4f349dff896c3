//! Crypto line negotiation between locally proposed and remotely proposed contexts.

use std::sync::Arc;

use anyhow::Result;

use super::{CryptoContext, CryptoSuite, SrtpEngine};

/// Number of candidate slots per negotiation line.
pub const CRYPTO_SLOTS: usize = 2;

/// Suites proposed locally, in preference order. Slot index + 1 is the crypto tag.
const LOCAL_SUITES: [CryptoSuite; CRYPTO_SLOTS] = [
    CryptoSuite::AesCm128HmacSha1_80,
    CryptoSuite::AesCm128HmacSha1_32,
];

/// Candidate contexts for both sides plus the pair chosen at start.
#[derive(Debug, Default)]
pub struct CryptoNegotiator {
    local: [Option<Arc<CryptoContext>>; CRYPTO_SLOTS],
    remote: [Option<Arc<CryptoContext>>; CRYPTO_SLOTS],
    negotiated_local: Option<Arc<CryptoContext>>,
    negotiated_remote: Option<Arc<CryptoContext>>,
}

impl CryptoNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the local candidates, keyed for the session's own SSRC.
    pub fn init_local(&mut self, engine: &SrtpEngine, ssrc: u32) -> Result<()> {
        for (i, suite) in LOCAL_SUITES.iter().enumerate() {
            let ctx = engine.create_local_context(i as u32 + 1, *suite, ssrc)?;
            self.local[i] = Some(Arc::new(ctx));
        }
        Ok(())
    }

    pub fn local(&self) -> impl Iterator<Item = &Arc<CryptoContext>> {
        self.local.iter().flatten()
    }

    /// Install a remote proposal in `slot`. Returns `false` if the slot is out of range.
    pub fn set_remote(&mut self, slot: usize, ctx: CryptoContext) -> bool {
        match self.remote.get_mut(slot) {
            Some(entry) => {
                *entry = Some(Arc::new(ctx));
                true
            }
            None => false,
        }
    }

    pub fn clear_remote(&mut self) {
        self.remote = Default::default();
    }

    /// Select the negotiated pair.
    ///
    /// The first initialized remote proposal wins if a local candidate shares
    /// its suite. Otherwise both selections are cleared and the session runs
    /// in cleartext. Returns whether encryption is in effect.
    pub fn negotiate(&mut self) -> bool {
        self.negotiated_local = None;
        self.negotiated_remote = None;

        let Some(remote) = self.remote.iter().flatten().next().cloned() else {
            tracing::info!("No remote crypto proposal, media will be sent in cleartext");
            return false;
        };

        let matching = self.local().find(|l| l.suite() == remote.suite()).cloned();
        match matching {
            Some(local) => {
                tracing::info!(
                    "SRTP negotiated: {} (local tag {}, remote tag {})",
                    local.suite(),
                    local.tag(),
                    remote.tag()
                );
                self.negotiated_local = Some(local);
                self.negotiated_remote = Some(remote);
                true
            }
            None => {
                tracing::warn!(
                    "No local crypto candidate matches remote suite {}, falling back to cleartext",
                    remote.suite()
                );
                false
            }
        }
    }

    pub fn negotiated_local(&self) -> Option<Arc<CryptoContext>> {
        self.negotiated_local.clone()
    }

    pub fn negotiated_remote(&self) -> Option<Arc<CryptoContext>> {
        self.negotiated_remote.clone()
    }
}
