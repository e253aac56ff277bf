// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces for capabilities the session engine consumes but does not implement.
mod authenticator;

pub use authenticator::{Authenticator, NoAuth};
