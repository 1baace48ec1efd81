//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Smtpkit.
//
// Smtpkit is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtpkit is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See  the GNU General Public  License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Smtpkit. If not, see <http://www.gnu.org/licenses/>.

//! Response codes from RFC 5321.
//!
//! The module is designed to be wildcard-imported, and defines the `pc`
//! submodule for accessing the enum values in a consistent way.
#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    // In the order RFC 5321 defines them
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    ServiceReady = 220,
    ServiceClosing = 221,
    ServiceNotAvailableClosing = 421,
    Ok = 250,
    ActionNotTakenTemporary = 450,
    ActionNotTakenPermanent = 550,
    InsufficientStorage = 452,
    ExceededStorageAllocation = 552,
    StartMailInput = 354,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}
