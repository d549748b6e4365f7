// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::io::{self, Read, Write};

use super::{to_str, Hash};
use crate::Serializable;

/// Length in bytes of a book prefix: the 192-bit head of an offer key that
/// groups offers by trading pair.
pub const BOOK_LEN: usize = 24;

pub type Book = [u8; BOOK_LEN];

/// An entry of the account-state tree at some sequence. The blob is opaque
/// to the core; an empty blob means the object does not exist.
#[derive(Default, Eq, PartialEq, Clone)]
pub struct LedgerObject {
    pub key: Hash,
    pub blob: Vec<u8>,
}

impl std::fmt::Debug for LedgerObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerObject")
            .field("key", &to_str(&self.key))
            .field("blob_len", &self.blob.len())
            .finish()
    }
}

impl LedgerObject {
    pub fn new(key: Hash, blob: Vec<u8>) -> Self {
        Self { key, blob }
    }

    pub fn book(&self) -> Book {
        book_of(&self.key)
    }
}

/// The book prefix of a state-tree key.
pub fn book_of(key: &Hash) -> Book {
    let mut book = [0u8; BOOK_LEN];
    book.copy_from_slice(&key[..BOOK_LEN]);
    book
}

/// One object mutation inside a ledger diff, as delivered by a peer.
/// Neighbor keys are present when the fetch requested object neighbors and
/// feed successor-pointer maintenance.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectDiff {
    pub key: Hash,
    pub blob: Vec<u8>,
    pub predecessor: Option<Hash>,
    pub successor: Option<Hash>,
}

impl ObjectDiff {
    pub fn is_created(&self) -> bool {
        !self.blob.is_empty() && self.predecessor.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }

    pub fn as_object(&self) -> LedgerObject {
        LedgerObject::new(self.key, self.blob.clone())
    }
}

impl Serializable for ObjectDiff {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.key)?;
        Self::write_var_le_bytes32(w, &self.blob)?;

        match self.predecessor {
            Some(key) => {
                w.write_all(&[1])?;
                w.write_all(&key)?;
            }
            None => w.write_all(&[0])?,
        }
        match self.successor {
            Some(key) => {
                w.write_all(&[1])?;
                w.write_all(&key)?;
            }
            None => w.write_all(&[0])?,
        }

        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let key = Self::read_bytes(r)?;
        let blob = Self::read_var_le_bytes32(r)?;

        let predecessor = match Self::read_u8(r)? {
            0 => None,
            _ => Some(Self::read_bytes(r)?),
        };
        let successor = match Self::read_u8(r)? {
            0 => None,
            _ => Some(Self::read_bytes(r)?),
        };

        Ok(Self {
            key,
            blob,
            predecessor,
            successor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_prefix() {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let book = book_of(&key);
        assert_eq!(&book[..], &key[..BOOK_LEN]);
    }

    #[test]
    fn diff_round_trip() {
        let diff = ObjectDiff {
            key: [3u8; 32],
            blob: vec![1, 2, 3, 4],
            predecessor: Some([2u8; 32]),
            successor: None,
        };
        let decoded = ObjectDiff::from_bytes(&diff.to_bytes()).unwrap();
        assert_eq!(decoded, diff);
    }
}
