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

//! Child process records and the fork/exec path.

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{close, fork, ForkResult, Pid};
use thiserror::Error;

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use crate::bootstrap::{BootstrapConfig, PrivateCommand};
use crate::config::UserGroup;
use crate::privsep;
use crate::status::{self, exit_code};

/// What a child does, and whether losing it is fatal to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Random,
    Auth,
    DataForAttestation,
    DataForCanonization,
    DataForProtocol,
    Notification,
    Canonization,
    Attestation,
    Protocol,
}

impl Role {
    /// Losing the data, notification or protocol services corrupts the
    /// daemon's view of the world; everything else can be restarted.
    pub fn fatal_on_loss(self) -> bool {
        matches!(
            self,
            Role::DataForAttestation
                | Role::DataForCanonization
                | Role::DataForProtocol
                | Role::Notification
                | Role::Protocol
        )
    }

    pub fn private_command(self) -> PrivateCommand {
        match self {
            Role::Random => PrivateCommand::RandomService,
            Role::Auth => PrivateCommand::AuthService,
            Role::DataForAttestation
            | Role::DataForCanonization
            | Role::DataForProtocol => PrivateCommand::DataService,
            Role::Notification => PrivateCommand::NotificationService,
            Role::Canonization => PrivateCommand::CanonizationService,
            Role::Attestation => PrivateCommand::AttestationService,
            Role::Protocol => PrivateCommand::ProtocolService,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Random => "random",
            Role::Auth => "auth",
            Role::DataForAttestation => "data(attestation)",
            Role::DataForCanonization => "data(canonization)",
            Role::DataForProtocol => "data(protocol)",
            Role::Notification => "notification",
            Role::Canonization => "canonization",
            Role::Attestation => "attestation",
            Role::Protocol => "protocol",
        }
    }
}

/// One spawned child.
#[derive(Debug)]
pub struct ServiceProcess {
    pub pid: Pid,
    pub role: Role,
}

/// Spawn failure.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("socketpair failed: {0}")]
    SocketPair(nix::Error),
    #[error("fork failed: {0}")]
    Fork(nix::Error),
}

/// Creates a connected stream socket pair. The first end stays in the
/// parent, the second is destined for a child.
pub fn stream_pair() -> Result<(UnixStream, OwnedFd), SpawnError> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(SpawnError::SocketPair)?;
    // SAFETY: socketpair just created both descriptors; each is owned by
    // exactly one wrapper.
    #[allow(unsafe_code)]
    let parent = unsafe { std::os::unix::io::FromRawFd::from_raw_fd(parent) };
    Ok((parent, OwnedFd(child)))
}

/// Creates a connected stream socket pair where both ends go to children.
pub fn fd_pair() -> Result<(OwnedFd, OwnedFd), SpawnError> {
    let (left, right) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(SpawnError::SocketPair)?;
    Ok((OwnedFd(left), OwnedFd(right)))
}

/// A raw descriptor with close-on-drop ownership, handed to children.
#[derive(Debug)]
pub struct OwnedFd(pub RawFd);

impl OwnedFd {
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Releases ownership without closing.
    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

/// Forks and execs a service child.
///
/// `fd_map` pairs each inherited descriptor with the fixed number the
/// service expects; `highest` is the top of that layout, above which every
/// descriptor is closed. In secure mode the child chroots into the prefix
/// and drops to the configured user/group first. The parent returns the
/// child pid and still owns every descriptor in `fd_map`; it closes its
/// copies afterwards.
#[allow(unsafe_code)]
pub fn spawn_service(
    bconf: &BootstrapConfig,
    usergroup: &UserGroup,
    role: Role,
    fd_map: &[(RawFd, RawFd)],
    highest: RawFd,
    runsecure: bool,
) -> Result<ServiceProcess, SpawnError> {
    // SAFETY: the child branch only calls privsep helpers and exec; the
    // parent branch returns immediately.
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => Ok(ServiceProcess { pid: child, role }),
        ForkResult::Child => {
            let status = child_setup(bconf, usergroup, role, fd_map, highest, runsecure);
            // Only reached when setup or exec failed.
            std::process::exit(exit_code(status));
        }
    }
}

fn child_setup(
    bconf: &BootstrapConfig,
    usergroup: &UserGroup,
    role: Role,
    fd_map: &[(RawFd, RawFd)],
    highest: RawFd,
    runsecure: bool,
) -> status::StatusWord {
    if runsecure {
        let (uid, gid) = match privsep::lookup_usergroup(&usergroup.user, &usergroup.group) {
            Ok(ids) => ids,
            Err(err) => return err.status(),
        };
        if let Err(err) = privsep::enter_chroot(&bconf.prefix_dir) {
            return err.status();
        }
        if let Err(err) = privsep::drop_privileges(uid, gid) {
            return err.status();
        }
    }

    if let Err(err) = privsep::remap_descriptors(fd_map) {
        return err.status();
    }
    if let Err(err) = privsep::close_standard_fds() {
        return err.status();
    }
    if let Err(err) = privsep::close_other_fds(highest) {
        return err.status();
    }

    // exec only returns on failure.
    privsep::exec_private(bconf, role.private_command().name()).status()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_roles_match_topology() {
        assert!(Role::DataForProtocol.fatal_on_loss());
        assert!(Role::Notification.fatal_on_loss());
        assert!(Role::Protocol.fatal_on_loss());
        assert!(!Role::Random.fatal_on_loss());
        assert!(!Role::Canonization.fatal_on_loss());
        assert!(!Role::Attestation.fatal_on_loss());
    }

    #[test]
    fn stream_pair_is_connected() {
        use std::io::{Read, Write};

        let (mut parent, child) = stream_pair().unwrap();
        // SAFETY: the test adopts the child end it owns.
        #[allow(unsafe_code)]
        let mut child: UnixStream =
            unsafe { std::os::unix::io::FromRawFd::from_raw_fd(child.into_raw()) };

        parent.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        child.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn roles_map_to_private_commands() {
        assert_eq!(
            Role::DataForCanonization.private_command(),
            PrivateCommand::DataService
        );
        assert_eq!(
            Role::Notification.private_command(),
            PrivateCommand::NotificationService
        );
    }
}
