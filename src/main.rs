/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(clippy::new_without_default)]
#![deny(clippy::cloned_instead_of_copied)]
#![deny(clippy::default_trait_access)]
#![deny(clippy::flat_map_option)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::map_unwrap_or)]
#![deny(clippy::needless_continue)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::redundant_else)]
#![deny(clippy::redundant_slicing)]
#![deny(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unnecessary_wraps)]
#![deny(clippy::unused_self)]

#[macro_use]
extern crate log;

mod changegroup;
mod commands;
mod git;
mod hg;
mod logging;
mod notes;
mod odb;
mod oid;
mod pack;
mod store;
mod tree_builder;
mod util;

use std::io::{stdin, stdout, BufWriter};
use std::path::PathBuf;

use clap::Parser;

use commands::CommandLoop;
use store::{Checks, Experiments, Store};

#[derive(Parser)]
#[command(
    name = "cinnabar-store",
    version,
    about = "Imports mercurial changegroup data into a git object store"
)]
struct Cli {
    /// Path to the git repository metadata directory.
    #[arg(long)]
    git_dir: Option<PathBuf>,

    /// Comma-separated list of extra checks to enable (helper,
    /// manifests, traceback).
    #[arg(long)]
    check: Option<String>,

    /// Comma-separated list of experimental features to enable
    /// (store).
    #[arg(long)]
    experiments: Option<String>,

    /// Size of the sliding window kept over the tail of the pack being
    /// written.
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    pack_window: u64,
}

pub fn main() {
    let cli = Cli::parse();
    logging::init();

    let checks = Checks::from_config(
        cli.check
            .or_else(|| std::env::var("CINNABAR_CHECK").ok())
            .as_deref()
            .unwrap_or(""),
    );
    let experiments = Experiments::from_config(
        cli.experiments
            .or_else(|| std::env::var("CINNABAR_EXPERIMENTS").ok())
            .as_deref()
            .unwrap_or(""),
    );

    std::panic::set_hook(Box::new(move |info| {
        if let Some(s) = info.payload().downcast_ref::<&str>() {
            eprintln!("fatal: {s}");
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            eprintln!("fatal: {s}");
        } else {
            eprintln!("fatal error");
        }
        if checks.contains(Checks::TRACEBACK) {
            eprintln!("{}", std::backtrace::Backtrace::force_capture());
        } else {
            eprintln!(
                "Run the command again with CINNABAR_CHECK=traceback to see the \
                 full traceback."
            );
        }
    }));

    let git_dir = cli
        .git_dir
        .or_else(|| std::env::var_os("GIT_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".git"));

    let store = Store::open(&git_dir, cli.pack_window, checks, experiments);
    let stdin = stdin();
    let stdout = stdout();
    let mut command_loop = CommandLoop::new(
        store,
        stdin.lock(),
        BufWriter::new(stdout.lock()),
    );
    command_loop.run();
}
