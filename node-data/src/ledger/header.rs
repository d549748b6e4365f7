// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::io::{self, Read, Write};

use serde::Serialize;

use super::{sha512_half, to_str, Hash};
use crate::Serializable;

/// A validated ledger header. The hashable body is canonical: encoding and
/// re-decoding a header yields a bit-identical record, and `hash` is always
/// the SHA-512Half of the encoded body.
#[derive(Default, Eq, PartialEq, Clone, Serialize)]
pub struct LedgerHeader {
    // Hashable fields
    pub sequence: u32,
    pub total_drops: u64,
    #[serde(serialize_with = "crate::serialize_hex")]
    pub parent_hash: Hash,
    #[serde(serialize_with = "crate::serialize_hex")]
    pub tx_tree_hash: Hash,
    #[serde(serialize_with = "crate::serialize_hex")]
    pub state_tree_hash: Hash,
    pub parent_close_time: i64,
    pub close_time: i64,
    pub close_time_resolution: i32,
    pub close_flags: u8,

    // Ledger hash, recomputed from the hashable fields
    #[serde(serialize_with = "crate::serialize_hex")]
    pub hash: Hash,
}

impl std::fmt::Debug for LedgerHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHeader")
            .field("sequence", &self.sequence)
            .field("hash", &to_str(&self.hash))
            .field("parent_hash", &to_str(&self.parent_hash))
            .field("tx_tree_hash", &to_str(&self.tx_tree_hash))
            .field("state_tree_hash", &to_str(&self.state_tree_hash))
            .field("total_drops", &self.total_drops)
            .field("close_time", &self.close_time)
            .field("close_flags", &self.close_flags)
            .finish()
    }
}

impl LedgerHeader {
    /// Marshal hashable fields.
    pub(crate) fn marshal_hashable<W: Write>(
        &self,
        w: &mut W,
    ) -> io::Result<()> {
        w.write_all(&self.sequence.to_le_bytes())?;
        w.write_all(&self.total_drops.to_le_bytes())?;
        w.write_all(&self.parent_hash)?;
        w.write_all(&self.tx_tree_hash)?;
        w.write_all(&self.state_tree_hash)?;
        w.write_all(&self.parent_close_time.to_le_bytes())?;
        w.write_all(&self.close_time.to_le_bytes())?;
        w.write_all(&self.close_time_resolution.to_le_bytes())?;
        w.write_all(&self.close_flags.to_le_bytes())?;

        Ok(())
    }

    pub(crate) fn unmarshal_hashable<R: Read>(r: &mut R) -> io::Result<Self> {
        let sequence = Self::read_u32_le(r)?;
        let total_drops = Self::read_u64_le(r)?;

        let parent_hash = Self::read_bytes(r)?;
        let tx_tree_hash = Self::read_bytes(r)?;
        let state_tree_hash = Self::read_bytes(r)?;

        let parent_close_time = Self::read_i64_le(r)?;
        let close_time = Self::read_i64_le(r)?;
        let close_time_resolution = Self::read_i32_le(r)?;
        let close_flags = Self::read_u8(r)?;

        Ok(LedgerHeader {
            sequence,
            total_drops,
            parent_hash,
            tx_tree_hash,
            state_tree_hash,
            parent_close_time,
            close_time,
            close_time_resolution,
            close_flags,
            hash: [0; 32],
        })
    }

    /// Recompute `hash` from the hashable body.
    pub fn seal(mut self) -> Self {
        let mut buf = vec![];
        self.marshal_hashable(&mut buf)
            .expect("marshalling into a Vec cannot fail");
        self.hash = sha512_half(&buf);
        self
    }
}

impl Serializable for LedgerHeader {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.marshal_hashable(w)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        Ok(Self::unmarshal_hashable(r)?.seal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faker;

    #[test]
    fn codec_round_trip() {
        let header = faker::gen_dummy_header(32570);

        let encoded = header.to_bytes();
        let decoded = LedgerHeader::from_bytes(&encoded).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.hash, sha512_half(&encoded));
    }

    #[test]
    fn hash_covers_every_field() {
        let base = faker::gen_dummy_header(100);

        let mut bumped = base.clone();
        bumped.total_drops += 1;
        let bumped = bumped.seal();
        assert_ne!(bumped.hash, base.hash);

        let mut flagged = base.clone();
        flagged.close_flags ^= 1;
        let flagged = flagged.seal();
        assert_ne!(flagged.hash, base.hash);
    }
}
