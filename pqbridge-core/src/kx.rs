//! Key-exchange group allow-list
//!
//! The TLS key-exchange group is chosen on the command line from a fixed list
//! of names. Names are matched exactly and rejected before any connection is
//! attempted.

use crate::{Error, Result};
use rustls::crypto::SupportedKxGroup;
use std::fmt;
use std::str::FromStr;

/// Key-exchange groups accepted for the broker handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyExchangeGroup {
    Kyber512,
    LightSaber,
    NtruHps2048509,
    P256,
    X25519,
}

impl KeyExchangeGroup {
    pub const ALL: [KeyExchangeGroup; 5] = [
        KeyExchangeGroup::Kyber512,
        KeyExchangeGroup::LightSaber,
        KeyExchangeGroup::NtruHps2048509,
        KeyExchangeGroup::P256,
        KeyExchangeGroup::X25519,
    ];

    /// Name as used on the command line and in the TLS library
    pub fn name(&self) -> &'static str {
        match self {
            KeyExchangeGroup::Kyber512 => "kyber512",
            KeyExchangeGroup::LightSaber => "lightsaber",
            KeyExchangeGroup::NtruHps2048509 => "ntruhps2048509",
            KeyExchangeGroup::P256 => "P-256",
            KeyExchangeGroup::X25519 => "X25519",
        }
    }

    pub fn is_post_quantum(&self) -> bool {
        matches!(
            self,
            KeyExchangeGroup::Kyber512
                | KeyExchangeGroup::LightSaber
                | KeyExchangeGroup::NtruHps2048509
        )
    }

    /// The rustls implementation of this group, if the linked provider has one
    pub fn rustls_group(&self) -> Option<&'static dyn SupportedKxGroup> {
        use rustls::crypto::ring::kx_group;
        match self {
            KeyExchangeGroup::P256 => Some(kx_group::SECP256R1),
            KeyExchangeGroup::X25519 => Some(kx_group::X25519),
            KeyExchangeGroup::Kyber512
            | KeyExchangeGroup::LightSaber
            | KeyExchangeGroup::NtruHps2048509 => None,
        }
    }

    /// Comma separated list of accepted names, for usage messages
    pub fn allowed_names() -> String {
        Self::ALL
            .iter()
            .map(|g| g.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Names of the groups the linked TLS provider can actually negotiate
    pub fn available_names() -> String {
        Self::ALL
            .iter()
            .filter(|g| g.rustls_group().is_some())
            .map(|g| g.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for KeyExchangeGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.name() == s)
            .ok_or_else(|| Error::InvalidGroup(s.to_string()))
    }
}

impl fmt::Display for KeyExchangeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
