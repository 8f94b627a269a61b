// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDMnet device.
//!
//! Discovers E1.33 controllers via DNS-SD (or connects straight to
//! `--controller-address`), opens a health-checked TCP session to the
//! highest-priority one and keeps re-selecting across failures.
//!
//! # Usage
//!
//! ```bash
//! # Discover controllers in the default scope
//! rdmnet-device --uid 7a70:00000001
//!
//! # Bypass discovery
//! rdmnet-device --controller-address 192.0.2.1:5569
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;

use clap::Parser;
use log::error;

use rdmnet::core::uid::RdmUid;

mod device;

use device::{Device, DeviceOptions};

/// Simple E1.33 device.
#[derive(Parser, Debug)]
#[command(name = "rdmnet-device")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The IP:Port of the controller; if set this bypasses discovery
    #[arg(long)]
    controller_address: Option<String>,

    /// The device's RDM UID (mmmm:dddddddd hex)
    #[arg(long, default_value = "7a70:00000001")]
    uid: String,

    /// Offset added to the UID's device id (for running fleets)
    #[arg(long, default_value = "0")]
    uid_offset: u32,

    /// The IP to advertise for RDM-over-UDP (unspecified = any)
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: Ipv4Addr,

    /// The UDP port to advertise for RDM
    #[arg(long, default_value = "5568")]
    udp_port: u16,

    /// The E1.33 scope to browse
    #[arg(long, default_value = "default")]
    e133_scope: String,

    /// The time in ms to let DNS-SD run before selecting a controller
    #[arg(long, default_value = "2000")]
    discovery_startup_delay: u64,

    /// Exit after this many seconds (0 = run forever)
    #[arg(long, default_value = "0")]
    terminate_after: u64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let uid = match args.uid.parse::<RdmUid>() {
        Ok(uid) => uid.with_offset(args.uid_offset),
        Err(e) => {
            error!("invalid --uid: {}", e);
            return ExitCode::from(2);
        }
    };
    if !uid.is_valid() {
        error!("invalid --uid: both halves must be non-zero");
        return ExitCode::from(2);
    }

    let static_controller = match &args.controller_address {
        Some(address) => match address.parse::<SocketAddrV4>() {
            Ok(address) => Some(address),
            Err(_) => {
                error!("invalid --controller-address {}", address);
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    let options = DeviceOptions {
        uid,
        udp_endpoint: SocketAddrV4::new(args.listen_ip, args.udp_port),
        scope: args.e133_scope,
        static_controller,
        discovery_startup_delay: std::time::Duration::from_millis(args.discovery_startup_delay),
        terminate_after: (args.terminate_after > 0)
            .then(|| std::time::Duration::from_secs(args.terminate_after)),
    };

    match Device::new(options).and_then(|mut device| device.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
