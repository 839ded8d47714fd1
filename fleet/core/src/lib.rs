// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tether fleet core
//!
//! Resilient command delivery between agents and servers (spool, sender,
//! failover) and the server-side resource lifecycle built on top of it.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, services, adapters and HTTP surface shared by
//!   the `tether` binary and its tests

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
