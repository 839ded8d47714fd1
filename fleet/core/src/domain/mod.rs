// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Types, traits and invariants shared by every fleet node: the command wire
//! contract, the spool and transport contracts, failover state, and the
//! server-side inventory model.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure model; no I/O beyond configuration file loading

pub mod agent_service;
pub mod authorization;
pub mod availability;
pub mod command;
pub mod deletion;
pub mod error;
pub mod events;
pub mod failover;
pub mod lifecycle;
pub mod node_config;
pub mod repository;
pub mod resource;
pub mod spool;
pub mod transport;
