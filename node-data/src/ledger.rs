// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

mod header;
pub use header::LedgerHeader;

mod object;
pub use object::{book_of, Book, LedgerObject, ObjectDiff, BOOK_LEN};

mod transaction;
pub use transaction::{AccountTxCursor, Transaction};

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

/// 256-bit identifier: ledger hashes, state-tree keys, transaction hashes.
pub type Hash = [u8; 32];

/// 160-bit account identifier.
pub type AccountId = [u8; 20];

/// The smallest possible state-tree key; anchors successor iteration.
pub const FIRST_KEY: Hash = [0u8; 32];

/// Terminal sentinel for successor pointers; no live key may equal it.
pub const LAST_KEY: Hash = [0xffu8; 32];

/// Encode a byte array into a shortened HEX representation.
pub fn to_str(bytes: &[u8]) -> String {
    const OFFSET: usize = 16;
    let hex = hex::encode(bytes);
    if bytes.len() <= OFFSET {
        return hex;
    }

    let len = hex.len();

    let first = &hex[0..OFFSET];
    let last = &hex[len - OFFSET..];

    format!("{first}...{last}")
}

/// SHA-512 truncated to its first 256 bits, the ledger's canonical digest.
pub fn sha512_half(data: &[u8]) -> Hash {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

/// Render an account id in the ledger's base58-check form.
pub fn account_to_base58(account: &AccountId) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(0u8);
    payload.extend_from_slice(account);
    let checksum = sha2::Sha256::digest(sha2::Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_string()
}

/// Parse a base58-check account string back into an account id.
pub fn account_from_base58(s: &str) -> anyhow::Result<AccountId> {
    let raw = bs58::decode(s)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_vec()?;
    if raw.len() != 25 || raw[0] != 0 {
        anyhow::bail!("malformed account id: {s}");
    }
    let checksum = sha2::Sha256::digest(sha2::Sha256::digest(&raw[..21]));
    if raw[21..] != checksum[..4] {
        anyhow::bail!("bad account id checksum: {s}");
    }
    let mut account = [0u8; 20];
    account.copy_from_slice(&raw[1..21]);
    Ok(account)
}

/// The inclusive interval of sequences fully persisted in the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRange {
    pub min_sequence: u32,
    pub max_sequence: u32,
}

impl LedgerRange {
    pub fn contains(&self, sequence: u32) -> bool {
        sequence >= self.min_sequence && sequence <= self.max_sequence
    }
}

impl fmt::Display for LedgerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min_sequence, self.max_sequence)
    }
}

/// True when live-key snapshots are persisted at `sequence`.
pub fn is_flag_ledger(sequence: u32, key_shift: u32) -> bool {
    sequence % (1u32 << key_shift) == 0
}

/// The flag ledger whose keys row covers reads at `sequence`: the next
/// multiple of `2^key_shift` at or above it.
pub fn key_index_of(sequence: u32, key_shift: u32) -> u32 {
    let window = 1u64 << key_shift;
    let seq = sequence as u64;
    (seq.div_ceil(window) * window).min(u32::MAX as u64) as u32
}
