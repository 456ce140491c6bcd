// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as nicflow;

pub mod api;
pub mod d_error;
pub mod engine;
pub mod print;
pub mod sys;

/// The execution context handed to every dataplane instance.
///
/// There is no global logger; everything that wants to log borrows
/// it from here.
pub struct ExecCtx {
    pub log: slog::Logger,
}

impl ExecCtx {
    pub fn new(log: slog::Logger) -> Self {
        Self { log }
    }

    /// A context which discards all log output.
    pub fn discard() -> Self {
        Self { log: slog::Logger::root(slog::Discard, slog::o!()) }
    }
}
