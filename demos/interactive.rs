// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A simple interactive demonstration of an ORAM kept in a local directory.
//!
//! Usage: `cargo run --example interactive [DIRECTORY]`. The directory holds the bucket files,
//! the snapshot, the key, and optionally an `oram.json` configuration. Running the example
//! again on the same directory picks up where the last run stopped.

use oram_store::{
    BlockId, EncryptionKey, FileSnapshotStore, FileStorage, Oram, OramConfig, OramError, PathOram,
};
use rand::rngs::OsRng;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;
use simplelog::{Config, LevelFilter, WriteLogger};
use std::path::PathBuf;

fn read_line(prompt: &str, rl: &mut Editor<(), FileHistory>) -> Result<String, ReadlineError> {
    println!("{}", prompt);
    println!();
    Ok(rl.readline("> ")?.trim().to_string())
}

fn read_block_id(rl: &mut Editor<(), FileHistory>) -> Result<BlockId, ReadlineError> {
    Ok(loop {
        let line = read_line("Which block?", rl)?;
        match BlockId::new(line) {
            Ok(block_id) => break block_id,
            Err(error) => {
                println!("{}. Try again.", error);
                continue;
            }
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    WriteLogger::init(LevelFilter::Warn, Config::default(), std::io::stderr())?;
    let mut rng = OsRng;

    let directory = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "oram_data".to_string()),
    );
    let storage = FileStorage::new(directory.join("buckets"))?;
    let config_path = directory.join("oram.json");
    let config = if config_path.exists() {
        OramConfig::from_json_file(&config_path)?
    } else {
        OramConfig {
            tree_height: 6,
            block_size: 256,
            ..OramConfig::default()
        }
    };
    let key = EncryptionKey::load_or_generate(&directory.join("oram.key"), &mut rng)?;
    let snapshots = FileSnapshotStore::new(directory.join("snapshot.json"));

    let mut oram: PathOram<_, _> = PathOram::new(storage, snapshots, &key, config, &mut rng)?;
    println!(
        "Opened an ORAM of height {} in {} holding {} blocks.",
        oram.geometry().height(),
        directory.display(),
        oram.block_count()
    );

    let mut rl = Editor::<(), FileHistory>::new()?;

    loop {
        let action = loop {
            println!("Enter an option (R, W, X, or Q):");
            println!("R) Read");
            println!("W) Write");
            println!("X) Reset");
            println!("Q) Quit");
            let action = match rl.readline("> ") {
                Ok(action) => action.trim().to_uppercase(),
                Err(ReadlineError::Eof | ReadlineError::Interrupted) => return Ok(()),
                Err(error) => return Err(error.into()),
            };
            if !["R", "W", "X", "Q"].contains(&action.as_str()) {
                println!("Try again.");
                continue;
            }
            break action;
        };

        let result = match action.as_str() {
            "R" => {
                let block_id = read_block_id(&mut rl)?;
                oram.read_block(&block_id, &mut rng).map(|payload| {
                    println!(
                        "Block {} holds {:?}.",
                        block_id,
                        String::from_utf8_lossy(&payload)
                    )
                })
            }
            "W" => {
                let block_id = read_block_id(&mut rl)?;
                let text = read_line("Text to write?", &mut rl)?;
                oram.write_block(&block_id, text.into_bytes(), &mut rng)
                    .map(|()| println!("Wrote block {}.", block_id))
            }
            "X" => oram
                .reset(&mut rng)
                .map(|()| println!("Every block has been forgotten.")),
            _ => return Ok(()),
        };

        match result {
            Ok(()) => println!("Stash now holds {} blocks.", oram.stash_occupancy()),
            Err(error) if error.is_transient() => println!("{}. Try again.", error),
            Err(error @ OramError::NotFoundError(_)) => println!("{}.", error),
            Err(error) => return Err(error.into()),
        }
    }
}
