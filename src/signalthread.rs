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

//! Signal delivery for event-loop services.
//!
//! Fibers must never be interrupted by signals directly. A dedicated OS
//! thread owns the termination signals via a blocked mask and `sigwait`,
//! and forwards a one-byte state word over an internal socket pair that
//! the event loop polls like any other readable resource.

use nix::sys::signal::{SigSet, SigmaskHow, Signal};

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;

/// State words written by the signal thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalState {
    /// Stop accepting new work, finish what is in flight.
    Quiesce = 0,
    /// Stop now.
    Terminate = 1,
}

impl SignalState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SignalState::Quiesce),
            1 => Some(SignalState::Terminate),
            _ => None,
        }
    }
}

fn termination_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGINT);
    set
}

/// Blocks the termination signals on the calling thread.
///
/// Must run before the event loop (and any worker threads) start, so every
/// subsequently spawned thread inherits the mask and only the signal
/// thread ever observes the signals.
pub fn block_termination_signals() -> nix::Result<()> {
    let set = termination_signals();
    nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
}

/// Spawns the signal thread. Returns the read side of the internal socket.
///
/// The thread writes one state byte per received signal: `Quiesce` for
/// SIGHUP, `Terminate` for SIGTERM/SIGQUIT/SIGINT, then exits after a
/// terminate.
pub fn spawn() -> std::io::Result<UnixStream> {
    let (read_side, mut write_side) = UnixStream::pair()?;
    let set = termination_signals();

    thread::Builder::new()
        .name("agentd-signal".into())
        .spawn(move || loop {
            match set.wait() {
                Ok(Signal::SIGHUP) => {
                    if write_side.write_all(&[SignalState::Quiesce as u8]).is_err() {
                        break;
                    }
                }
                Ok(_) => {
                    let _ = write_side.write_all(&[SignalState::Terminate as u8]);
                    break;
                }
                Err(_) => break,
            }
        })?;

    Ok(read_side)
}
