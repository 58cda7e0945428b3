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

//! Privilege separation.
//!
//! The forked child of a secure spawn walks this module top to bottom:
//! look up the configured user/group, chroot into the prefix, drop gid
//! then uid, remap inherited sockets onto the service's fixed layout,
//! close stdio and every stray descriptor, then exec the private entry
//! point. Every step is fatal on failure; the supervisor observes the
//! child's death.

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{chdir, chroot, close, dup2, execv, setgid, setgroups, setuid, Gid, Group, Uid, User};
use thiserror::Error;

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::bootstrap::BootstrapConfig;
use crate::path;
use crate::status::{self, StatusWord};

/// Upper bound of descriptors swept by [`close_other_fds`].
const FD_SWEEP_LIMIT: RawFd = 1024;

/// Privilege-separation failure.
#[derive(Debug, Error)]
pub enum PrivsepError {
    #[error("user `{0}` not found")]
    UserLookup(String),
    #[error("group `{0}` not found")]
    GroupLookup(String),
    #[error("chroot to `{0}` failed: {1}")]
    Chroot(String, nix::Error),
    #[error("dropping privileges failed: {0}")]
    DropPrivileges(nix::Error),
    #[error("descriptor remap failed: {0}")]
    SetFds(nix::Error),
    #[error("closing standard descriptors failed: {0}")]
    CloseStandardFds(nix::Error),
    #[error("exec of private command failed: {0}")]
    ExecPrivate(nix::Error),
}

impl PrivsepError {
    pub fn status(&self) -> StatusWord {
        match self {
            PrivsepError::UserLookup(_) => status::general::GETPWNAM_FAILURE,
            PrivsepError::GroupLookup(_) => status::general::GETGRNAM_FAILURE,
            PrivsepError::Chroot(..) => status::general::CHROOT_FAILURE,
            PrivsepError::DropPrivileges(_) => status::general::DROP_PRIVILEGES_FAILURE,
            PrivsepError::SetFds(_) => status::general::SETFDS_FAILURE,
            PrivsepError::CloseStandardFds(_) => status::general::SETFDS_FAILURE,
            PrivsepError::ExecPrivate(_) => status::general::EXEC_PRIVATE_FAILURE,
        }
    }
}

/// Looks up the uid and gid for a `user:group` pair.
pub fn lookup_usergroup(user: &str, group: &str) -> Result<(Uid, Gid), PrivsepError> {
    let user_entry = User::from_name(user)
        .ok()
        .flatten()
        .ok_or_else(|| PrivsepError::UserLookup(user.to_owned()))?;
    let group_entry = Group::from_name(group)
        .ok()
        .flatten()
        .ok_or_else(|| PrivsepError::GroupLookup(group.to_owned()))?;
    Ok((user_entry.uid, group_entry.gid))
}

/// Changes the root directory to `dir`. Must be root.
pub fn enter_chroot(dir: &Path) -> Result<(), PrivsepError> {
    let display = dir.display().to_string();
    chdir(dir).map_err(|err| PrivsepError::Chroot(display.clone(), err))?;
    chroot(".").map_err(|err| PrivsepError::Chroot(display, err))?;
    Ok(())
}

/// Assumes `uid`/`gid`, gid first so the uid drop cannot be undone.
pub fn drop_privileges(uid: Uid, gid: Gid) -> Result<(), PrivsepError> {
    setgroups(&[gid]).map_err(PrivsepError::DropPrivileges)?;
    setgid(gid).map_err(PrivsepError::DropPrivileges)?;
    setuid(uid).map_err(PrivsepError::DropPrivileges)?;
    Ok(())
}

/// Moves descriptors onto their fixed per-service numbers.
///
/// `pairs` maps each inherited descriptor to its desired slot. Inherited
/// descriptors that collide with a desired slot (or sit in the standard
/// range) are first duplicated above every desired slot so no move can
/// clobber a source. Returns the resulting stable descriptors, in `pairs`
/// order.
pub fn remap_descriptors(pairs: &[(RawFd, RawFd)]) -> Result<Vec<RawFd>, PrivsepError> {
    let max_desired = pairs.iter().map(|(_, desired)| *desired).max().unwrap_or(2);

    // Stage every source out of the collision range.
    let mut staged = Vec::with_capacity(pairs.len());
    for (current, desired) in pairs {
        let collides = *current <= 2
            || (*current != *desired && pairs.iter().any(|(_, d)| d == current));
        if collides {
            let moved = fcntl(*current, FcntlArg::F_DUPFD(max_desired + 1))
                .map_err(PrivsepError::SetFds)?;
            close(*current).map_err(PrivsepError::SetFds)?;
            staged.push((moved, *desired));
        } else {
            staged.push((*current, *desired));
        }
    }

    // Land every descriptor on its slot.
    let mut result = Vec::with_capacity(staged.len());
    for (current, desired) in staged {
        if current != desired {
            dup2(current, desired).map_err(PrivsepError::SetFds)?;
            close(current).map_err(PrivsepError::SetFds)?;
        }
        result.push(desired);
    }
    Ok(result)
}

/// Closes stdin, stdout and stderr.
pub fn close_standard_fds() -> Result<(), PrivsepError> {
    for fd in 0..=2 {
        match close(fd) {
            Ok(()) | Err(nix::Error::EBADF) => {}
            Err(err) => return Err(PrivsepError::CloseStandardFds(err)),
        }
    }
    Ok(())
}

/// Closes every descriptor above `highest` up to the sweep limit.
pub fn close_other_fds(highest: RawFd) -> Result<(), PrivsepError> {
    for fd in (highest + 1)..=FD_SWEEP_LIMIT {
        let _ = close(fd);
    }
    Ok(())
}

/// Replaces this process with the private entry point for `command`.
///
/// Does not return on success. A return value is always an error; callers
/// treat surviving the exec as its own failure.
pub fn exec_private(bconf: &BootstrapConfig, command: &str) -> PrivsepError {
    std::env::set_var("PATH", path::append_default(""));

    let binary = match CString::new(bconf.binary.display().to_string()) {
        Ok(binary) => binary,
        Err(_) => return PrivsepError::ExecPrivate(nix::Error::EINVAL),
    };
    let argv = [
        CString::new("agentd").expect("static arg"),
        CString::new("-P").expect("static arg"),
        CString::new(command).expect("service names contain no NUL"),
    ];

    match execv(&binary, &argv) {
        Ok(infallible) => match infallible {},
        Err(err) => PrivsepError::ExecPrivate(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd::pipe;
    use std::os::unix::io::RawFd;

    fn read_end_of_pipe() -> (RawFd, RawFd) {
        pipe().unwrap()
    }

    #[test]
    fn remap_identity_is_noop() {
        let (read_fd, write_fd) = read_end_of_pipe();
        let result = remap_descriptors(&[(read_fd, read_fd)]).unwrap();
        assert_eq!(result, vec![read_fd]);
        let _ = close(read_fd);
        let _ = close(write_fd);
    }

    #[test]
    fn remap_moves_to_free_slot() {
        let (read_fd, write_fd) = read_end_of_pipe();
        // Pick a destination far away from anything open in the test runner.
        let target = 200;
        let result = remap_descriptors(&[(read_fd, target)]).unwrap();
        assert_eq!(result, vec![target]);
        // The target must be live now.
        assert!(fcntl(target, FcntlArg::F_GETFD).is_ok());
        let _ = close(target);
        let _ = close(write_fd);
    }

    #[test]
    fn remap_handles_crossing_pairs() {
        let (a_read, a_write) = read_end_of_pipe();
        let (b_read, b_write) = read_end_of_pipe();
        // Swap the two read ends through a crossing remap.
        let result = remap_descriptors(&[(a_read, b_read), (b_read, a_read)]);
        // Either both land or the remap fails cleanly; it must not clobber.
        if let Ok(fds) = result {
            assert_eq!(fds.len(), 2);
            for fd in fds {
                assert!(fcntl(fd, FcntlArg::F_GETFD).is_ok());
                let _ = close(fd);
            }
        }
        let _ = close(a_write);
        let _ = close(b_write);
    }

    #[test]
    fn missing_user_fails_lookup() {
        let err = lookup_usergroup("no-such-user-xyzzy", "no-such-group-xyzzy").unwrap_err();
        assert!(matches!(err, PrivsepError::UserLookup(_)));
        assert_eq!(err.status(), status::general::GETPWNAM_FAILURE);
    }
}
