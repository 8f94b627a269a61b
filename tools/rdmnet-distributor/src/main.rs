// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDMnet distributor.
//!
//! The higher-tier aggregation point of an E1.33 deployment: it
//! advertises the distributor service type for its scope and accepts
//! health-checked TCP sessions from controllers. RDM traffic relayed
//! through a distributor is acked at this layer like a controller would.
//!
//! # Usage
//!
//! ```bash
//! rdmnet-distributor --listen-port 5570 --e133-scope default
//! ```

use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::Parser;
use log::error;

mod distributor;

use distributor::{Distributor, DistributorOptions};

/// Simple E1.33 distributor.
#[derive(Parser, Debug)]
#[command(name = "rdmnet-distributor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The IP address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: Ipv4Addr,

    /// The port to listen on
    #[arg(long, default_value = "5570")]
    listen_port: u16,

    /// The backlog for the listen() call. Often limited to 128
    #[arg(long, default_value = "100")]
    listen_backlog: u16,

    /// The E1.33 scope to advertise
    #[arg(long, default_value = "default")]
    e133_scope: String,

    /// Exit after this many seconds (0 = run forever)
    #[arg(long, default_value = "0")]
    terminate_after: u64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let options = DistributorOptions {
        listen_ip: args.listen_ip,
        listen_port: args.listen_port,
        listen_backlog: args.listen_backlog,
        scope: args.e133_scope,
        terminate_after: (args.terminate_after > 0)
            .then(|| std::time::Duration::from_secs(args.terminate_after)),
    };

    match Distributor::new(options).and_then(|mut distributor| distributor.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
