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

//! Fixed descriptor layout per service.
//!
//! After privilege separation each service finds its sockets at these
//! numbers. The values are part of the ABI between the supervisor and the
//! private entry points: the supervisor remaps inherited descriptors to
//! exactly this layout before exec, and the entry point adopts them by
//! number. Standard descriptors 0..=2 are closed first, so layouts start
//! at 3.

use std::os::unix::io::RawFd;

/// Random service layout.
pub mod random {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const HIGHEST: RawFd = CONTROL;
}

/// Auth service layout.
pub mod auth {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const HIGHEST: RawFd = CONTROL;
}

/// Data service layout.
pub mod data {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const HIGHEST: RawFd = CONTROL;
}

/// Notification service layout. `CLIENT1` is the canonization side,
/// `CLIENT2` the protocol side.
pub mod notification {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CLIENT1: RawFd = 4;
    pub const CLIENT2: RawFd = 5;
    pub const HIGHEST: RawFd = CLIENT2;
}

/// Canonization service layout.
pub mod canonization {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const DATA: RawFd = 5;
    pub const NOTIFY: RawFd = 6;
    pub const HIGHEST: RawFd = NOTIFY;
}

/// Attestation service layout.
pub mod attestation {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const DATA: RawFd = 5;
    pub const HIGHEST: RawFd = DATA;
}

/// Protocol service layout.
pub mod protocol {
    use super::RawFd;
    pub const LOG: RawFd = 3;
    pub const CONTROL: RawFd = 4;
    pub const RANDOM: RawFd = 5;
    pub const ACCEPT: RawFd = 6;
    pub const DATA: RawFd = 7;
    pub const NOTIFY: RawFd = 8;
    pub const HIGHEST: RawFd = NOTIFY;
}
