// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`tether-fleet-core`)
//!
//! HTTP surface of a fleet node. No business logic lives here; every route
//! delegates to a service in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`commands`] | HTTP/JSON (Axum) | Command ingress for peer nodes |
//! | [`api`] | HTTP/SSE (Axum) | Operator routes and the event stream |
//! | [`inventory`] | HTTP/JSON (Axum) | Server-side lifecycle entry points |

pub mod api;
pub mod commands;
pub mod inventory;
