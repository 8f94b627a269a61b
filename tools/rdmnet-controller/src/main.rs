// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDMnet controller.
//!
//! Listens for TCP connections from devices (reverse-connection model),
//! advertises itself via DNS-SD, meshes with the other controllers in the
//! scope and gossips device acquisition between them.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port, default scope
//! rdmnet-controller
//!
//! # A second controller in a separate scope
//! rdmnet-controller --listen-port 5570 --e133-scope group-a
//! ```
//!
//! While running, single-key commands on stdin show state:
//! `c` peers, `d` devices, `s` summary, `u` UID map, `q` quit.

use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::Parser;
use log::error;

mod controller;

use controller::{Controller, ControllerOptions};

/// Simple E1.33 controller.
#[derive(Parser, Debug)]
#[command(name = "rdmnet-controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The IP address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: Ipv4Addr,

    /// The port to listen on
    #[arg(long, default_value = "5569")]
    listen_port: u16,

    /// The backlog for the listen() call. Often limited to 128
    #[arg(long, default_value = "100")]
    listen_backlog: u16,

    /// The priority advertised in the TXT record
    #[arg(long, default_value = "100")]
    priority: u8,

    /// The E1.33 scope to advertise and browse
    #[arg(long, default_value = "default")]
    e133_scope: String,

    /// Time how long it takes until this many devices connect
    #[arg(long, default_value = "1")]
    expected_devices: usize,

    /// Exit once all expected devices connect
    #[arg(long, default_value = "false")]
    stop_after_all_devices: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let options = ControllerOptions {
        listen_ip: args.listen_ip,
        listen_port: args.listen_port,
        listen_backlog: args.listen_backlog,
        priority: args.priority,
        scope: args.e133_scope,
        expected_devices: args.expected_devices,
        stop_after_all_devices: args.stop_after_all_devices,
    };

    match Controller::new(options).and_then(|mut controller| controller.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
