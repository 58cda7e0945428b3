// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Privilege-separated blockchain agent daemon.
//!
//! `agentd` runs as a tree of single-purpose processes rooted at a
//! supervisor. Each child is spawned with exactly the socket pairs it needs,
//! chrooted, stripped of privileges and re-executed through a private entry
//! point. Services speak a typed, length-prefixed request/response protocol
//! over those sockets; every request is gated by a capability check, and
//! client-facing edges carry encrypted, authenticated packets.
//!
//! # Overview
//!
//! - [`supervisor`] owns the process topology: spawn order, socket wiring,
//!   monitoring and shutdown.
//! - [`dataservice`] owns the canonical chain state: blocks, the process
//!   queue of pending transactions, artifacts and global settings.
//! - [`notificationservice`] tracks latest-block assertions and fans out
//!   invalidations when the chain head moves.
//! - [`canonizationservice`] periodically drains the process queue into a
//!   new signed block.
//! - [`attestationservice`] verifies and promotes submitted transactions.
//! - [`protocolservice`] terminates client connections and proxies
//!   authorized requests to the data and notification services.
//! - [`randomservice`] and [`authservice`] are small leaf helpers.

#![warn(
    missing_debug_implementations,
    unsafe_code,
    bare_trait_objects
)]
#![allow(clippy::module_name_repetitions, clippy::similar_names)]

pub mod attestationservice;
pub mod authservice;
pub mod bitcap;
pub mod bootstrap;
pub mod canonizationservice;
pub mod cert;
pub mod command;
pub mod config;
pub mod crypto;
pub mod dataservice;
pub mod fd;
pub mod ipc;
pub mod keys;
pub mod logger;
pub mod notificationservice;
pub mod path;
pub mod privsep;
pub mod protocolservice;
pub mod randomservice;
pub mod signalthread;
pub mod status;
pub mod supervisor;

/// 128-bit opaque identifier used for entities, transactions, artifacts and
/// blocks. Equality is byte equality; ordering carries no meaning beyond
/// explicit indices.
pub type Id = uuid::Uuid;

/// The all-zero identifier. A transaction on the process queue carries this
/// as its block id; capability triples use it as the "any object" sentinel.
pub fn zero_id() -> Id {
    uuid::Uuid::nil()
}
