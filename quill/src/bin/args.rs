// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "quill", version, about = "Ledger indexer and API server")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long = "conf", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run a named schema migration and exit.
    #[arg(long = "migrate", value_name = "NAME")]
    pub migrate: Option<String>,

    /// Overrides the configured log level.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,
}
