// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Flatten nested error enums into a list of static names.
//!
//! The packet path reports drops by name (in logs and in per-reason
//! counters) without formatting a `String` for every packet.

pub use derror_macro::DError;
use std::fmt;
use std::fmt::Display;

/// A trait used for walking chains of errors which store useful data
/// in a leaf node.
pub trait DError {
    /// Provide the name of an error's discriminant.
    fn discriminant(&self) -> &'static str;

    /// Provide a reference to the next error in the chain.
    fn child(&self) -> Option<&dyn DError>;

    /// Store data from a leaf error.
    fn leaf_data(&self, _data: &mut [u64]) {}
}

/// The names of all enum discriminants encountered when resolving an
/// error, outermost first, along with the data from its leaf.
#[derive(Clone, Copy, Debug)]
pub struct ErrorBlock<const L: usize> {
    len: usize,
    more: bool,
    data: [u64; 2],
    entries: [&'static str; L],
}

/// Signals that an [`ErrorBlock`] could not contain a new entry.
#[derive(Clone, Copy, Debug)]
pub struct ErrorBlockFull;

impl<const L: usize> Default for ErrorBlock<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const L: usize> ErrorBlock<L> {
    /// Create storage to hold at most `L` names.
    pub fn new() -> Self {
        Self { entries: [""; L], len: 0, more: false, data: [0; 2] }
    }

    /// Flatten a nested error into a name list.
    ///
    /// If `err` is nested deeper than `L`, the truncated block is
    /// returned as the error.
    pub fn from_err(err: &dyn DError) -> Result<ErrorBlock<L>, ErrorBlock<L>> {
        let mut out = ErrorBlock::new();

        if out.append(err).is_err() { Err(out) } else { Ok(out) }
    }

    /// Push all layers (and data) of an error into a block.
    pub fn append(&mut self, err: &dyn DError) -> Result<(), ErrorBlockFull> {
        let mut top: Option<&dyn DError> = Some(err);
        while let Some(el) = top {
            self.append_name(el)?;
            top = el.child();

            if top.is_none() {
                el.leaf_data(&mut self.data[..]);
            }
        }
        Ok(())
    }

    /// Append the top layer name of a given error.
    pub fn append_name(
        &mut self,
        err: &dyn DError,
    ) -> Result<(), ErrorBlockFull> {
        if self.len >= L {
            self.more = true;
            return Err(ErrorBlockFull);
        }

        self.entries[self.len] = err.discriminant();
        self.len += 1;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Were names dropped for lack of room?
    pub fn is_truncated(&self) -> bool {
        self.more
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &'static str> + '_ {
        self.entries[..self.len].iter().copied()
    }

    /// The innermost name, which is usually the most specific.
    pub fn leaf(&self) -> Option<&'static str> {
        self.len.checked_sub(1).map(|i| self.entries[i])
    }

    /// Provides access to data stored in a leaf error.
    pub fn data(&self) -> &[u64] {
        &self.data[..]
    }
}

impl<const L: usize> Display for ErrorBlock<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.entries().enumerate() {
            if i > 0 {
                write!(f, "::")?;
            }
            write!(f, "{name}")?;
        }

        if self.more {
            write!(f, "::..")?;
        }

        Ok(())
    }
}
