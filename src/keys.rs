//! Signing key loading.
//!
//! The key is stored obfuscated with a fixed alphanumeric substitution table
//! so that a leaked config value is not recognisable as a private key at a
//! glance. This is obfuscation, not encryption.

use alloy_primitives::{Address, keccak256};
use anyhow::{Context, Result, bail};
use k256::ecdsa::SigningKey;
use std::fmt;
use std::str::FromStr;

use crate::tx::{SignedTx, UnsignedTx};

const CHARSET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SHUFFLED_CHARSET: &[u8; 62] =
    b"WSRQLbOkn7iJCyoPMgYw04VhBaj8dcl2xez5E3mrqHpftuNGFADK9sUTv6ZX1I";

/// How `SIGNING_KEY` is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Obfuscated,
    Plain,
}

impl FromStr for KeyEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "obfuscated" => Ok(Self::Obfuscated),
            "plain" | "hex" => Ok(Self::Plain),
            other => Err(format!("unknown key encoding {other:?}")),
        }
    }
}

fn translate(input: &str, from: &[u8; 62], to: &[u8; 62]) -> String {
    input
        .chars()
        .map(|c| {
            u8::try_from(c)
                .ok()
                .and_then(|b| from.iter().position(|&x| x == b))
                .map_or(c, |i| char::from(to[i]))
        })
        .collect()
}

/// Apply the substitution table. Used to prepare config values.
pub fn obfuscate(key: &str) -> String {
    translate(key, CHARSET, SHUFFLED_CHARSET)
}

/// Invert [`obfuscate`].
pub fn deobfuscate(obfuscated: &str) -> String {
    translate(obfuscated, SHUFFLED_CHARSET, CHARSET)
}

/// The relay's signing account.
#[derive(Clone)]
pub struct Wallet {
    key: SigningKey,
    address: Address,
}

impl Wallet {
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret).context("not a valid secp256k1 secret key")?;
        let point = key.verifying_key().to_encoded_point(false);
        let address = Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..]);
        Ok(Self { key, address })
    }

    /// Decode a configured key value.
    pub fn decode(value: &str, encoding: KeyEncoding) -> Result<Self> {
        let revealed = match encoding {
            KeyEncoding::Obfuscated => deobfuscate(value.trim()),
            KeyEncoding::Plain => value.trim().to_string(),
        };
        let hex_key = revealed.strip_prefix("0x").unwrap_or(&revealed);
        if hex_key.len() != 64 {
            bail!(
                "signing key decryption failed: expected 64 hex characters, got {}",
                hex_key.len()
            );
        }
        let secret = hex::decode(hex_key).context("signing key decryption failed")?;
        Self::from_secret(&secret).context("signing key decryption failed")
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx, k256::ecdsa::Error> {
        tx.sign(&self.key)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
