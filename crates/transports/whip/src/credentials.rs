//! ICE credential generation
//!
//! Credentials are the only non-deterministic part of an answer, so they sit
//! behind [`CredentialSource`] and can be swapped for a fixed source in tests.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated ICE username fragments
pub const UFRAG_LEN: usize = 16;

/// Length of generated ICE passwords (RFC 8839 requires at least 22)
pub const PWD_LEN: usize = 32;

/// Local ICE username fragment and password for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Capability that produces ICE credentials for a new negotiation
pub trait CredentialSource: Send + Sync {
    fn ice_credentials(&self) -> IceCredentials;
}

/// Cryptographically random credentials from the thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCredentials;

impl CredentialSource for RandomCredentials {
    fn ice_credentials(&self) -> IceCredentials {
        IceCredentials {
            ufrag: random_token(UFRAG_LEN),
            pwd: random_token(PWD_LEN),
        }
    }
}

/// Always returns the same credentials
#[derive(Debug, Clone)]
pub struct FixedCredentials(pub IceCredentials);

impl FixedCredentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self(IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        })
    }
}

impl CredentialSource for FixedCredentials {
    fn ice_credentials(&self) -> IceCredentials {
        self.0.clone()
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
