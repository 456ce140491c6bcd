// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod cfg;
pub mod encap;
pub mod error;
pub mod flow;
pub mod ip;
pub mod mac;
pub mod stat;

pub use cfg::*;
pub use encap::*;
pub use error::*;
pub use flow::*;
pub use ip::*;
pub use mac::*;
pub use stat::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified in a way that changes its serialized
/// form, this number should increment.
pub const API_VERSION: u64 = 3;

/// Major version of the nicflow package.
pub const MAJOR_VERSION: u64 = 0;

/// Identifies a physical port.
pub type PortId = u16;

/// Identifies a receive/transmit queue on a port.
pub type QueueId = u16;

/// The port paired with `port` for hairpin forwarding.
///
/// Ports are provisioned in pairs: 0 with 1, 2 with 3, and so on.
pub const fn hairpin_peer(port: PortId) -> PortId {
    port ^ 1
}
