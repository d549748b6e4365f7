// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Deterministic dummy records for tests. Everything here is derived from
//! the caller-provided seeds so assertions can be written against exact
//! values.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ledger::{
    AccountId, Hash, LedgerHeader, ObjectDiff, Transaction,
};

pub fn gen_key(seed: u64) -> Hash {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut key = [0u8; 32];
    rng.fill(&mut key);
    key
}

pub fn gen_account(seed: u64) -> AccountId {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31).wrapping_add(7));
    let mut account = [0u8; 20];
    rng.fill(&mut account);
    account
}

pub fn gen_blob(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

pub fn gen_dummy_header(sequence: u32) -> LedgerHeader {
    let parent = if sequence == 0 {
        [0u8; 32]
    } else {
        gen_key(sequence as u64 - 1)
    };

    LedgerHeader {
        sequence,
        total_drops: 100_000_000_000_000_000,
        parent_hash: parent,
        tx_tree_hash: gen_key(sequence as u64 + 1_000_000),
        state_tree_hash: gen_key(sequence as u64 + 2_000_000),
        parent_close_time: sequence as i64 * 10 - 10,
        close_time: sequence as i64 * 10,
        close_time_resolution: 10,
        close_flags: 0,
        hash: [0; 32],
    }
    .seal()
}

pub fn gen_dummy_diff(sequence: u32, key_seed: u64, deleted: bool) -> ObjectDiff {
    ObjectDiff {
        key: gen_key(key_seed),
        blob: if deleted {
            vec![]
        } else {
            gen_blob(key_seed ^ (sequence as u64) << 32, 48)
        },
        predecessor: None,
        successor: None,
    }
}

pub fn gen_dummy_tx(sequence: u32, index: u32) -> Transaction {
    let seed = ((sequence as u64) << 24) | index as u64;
    Transaction {
        hash: gen_key(seed ^ 0xa5a5_a5a5),
        ledger_sequence: sequence,
        transaction_index: index,
        date: sequence as i64 * 10,
        transaction_blob: gen_blob(seed, 64),
        metadata_blob: gen_blob(seed ^ 1, 96),
        accounts: vec![gen_account(seed % 5), gen_account(seed % 7 + 100)],
    }
}
