use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

use crate::protocol::Channel;

/// Length of a freshly generated token.
pub const TOKEN_LEN: usize = 32;

/// Per-spawn secret a wrapper presents to prove it was launched by this engine.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityToken(String);

impl SecurityToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Alphanumeric.sample_string(&mut rand::rng(), TOKEN_LEN))
    }

    /// Compare in time independent of where the first mismatch is.
    #[must_use]
    pub fn matches(&self, presented: &Self) -> bool {
        let ours = self.0.as_bytes();
        let theirs = presented.0.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.iter()
            .zip(theirs)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecurityToken(<redacted>)")
    }
}

impl From<&str> for SecurityToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One token per wrapper connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelTokens {
    pub control: SecurityToken,
    pub stdin: SecurityToken,
    pub stdout: SecurityToken,
    pub stderr: SecurityToken,
}

impl ChannelTokens {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            control: SecurityToken::generate(),
            stdin: SecurityToken::generate(),
            stdout: SecurityToken::generate(),
            stderr: SecurityToken::generate(),
        }
    }

    #[must_use]
    pub const fn get(&self, channel: Channel) -> &SecurityToken {
        match channel {
            Channel::Control => &self.control,
            Channel::Stdin => &self.stdin,
            Channel::Stdout => &self.stdout,
            Channel::Stderr => &self.stderr,
        }
    }
}
