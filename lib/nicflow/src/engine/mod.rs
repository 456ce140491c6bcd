// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The flow offload engine.

pub mod aging;
pub mod dataplane;
pub mod flow_key;
pub mod flow_table;
pub mod headers;
pub mod io;
pub mod lifecycle;
pub mod offload;
pub mod parse;
pub mod pipeline;
pub mod qos;
pub mod reconcile;
pub mod soft;
pub mod worker;

pub use dataplane::Dataplane;
pub use dataplane::DropReason;
pub use dataplane::FallbackReason;
pub use dataplane::ProcessResult;
pub use parse::PacketView;
pub use soft::SoftEngine;
