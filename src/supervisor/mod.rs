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

//! The supervisor.
//!
//! Owns the process tree: creates every socket pair, spawns the services
//! in dependency order, shapes each data-service instance's capability
//! set for its consumer, configures the canonization and protocol
//! services over their control sockets, then watches for signals and
//! child deaths. Shutdown is SIGTERM to every child, a five second grace
//! period, then SIGKILL.

pub mod proc;

use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Uid;
use thiserror::Error;
use uuid::Uuid;

use std::io::Read;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::bootstrap::BootstrapConfig;
use crate::canonizationservice::api::blocking as canonization_control;
use crate::config::AgentConfig;
use crate::dataservice::api::blocking as data_control;
use crate::dataservice::api::ApiError as DataApiError;
use crate::ipc::frame;
use crate::keys::{KeyError, PrivateKeyFile, RootBlockFile};
use crate::logger::spawn_log_drain;
use crate::protocolservice::capabilities::verb_by_name;
use crate::protocolservice::control::blocking as protocol_control;
use crate::signalthread::{self, SignalState};
use crate::status::STATUS_SUCCESS;
use crate::{attestationservice, authservice, canonizationservice, fd, protocolservice, zero_id};

use self::proc::{fd_pair, spawn_service, stream_pair, Role, ServiceProcess, SpawnError};

/// Grace period between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Supervisor failure.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {role}: {source}")]
    Spawn {
        role: &'static str,
        source: SpawnError,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("cannot bind listen endpoint: {0}")]
    Bind(std::io::Error),
    #[error("signal setup failed: {0}")]
    Signal(std::io::Error),
    #[error("data service setup failed: {0}")]
    DataSetup(#[from] DataApiError),
    #[error("auth service setup failed")]
    AuthSetup,
    #[error("canonization setup failed: {0}")]
    CanonizationSetup(#[from] canonizationservice::api::ApiError),
    #[error("protocol setup failed: {0}")]
    ProtocolSetup(#[from] crate::protocolservice::control::ApiError),
    #[error("bad view configuration: {0}")]
    InvalidView(String),
    #[error("critical service {0} exited")]
    CriticalChildLost(&'static str),
}

fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        root.join(path)
    }
}

/// Loads the agent key material, generating it first in init mode.
fn load_key_material(
    bconf: &BootstrapConfig,
    conf: &AgentConfig,
) -> Result<(PrivateKeyFile, RootBlockFile), SupervisorError> {
    let root_dir = conf.chroot_or(&bconf.prefix_dir);
    let secret_path = resolve_under(root_dir, &conf.secret);
    let rootblock_path = resolve_under(root_dir, &conf.rootblock);

    if bconf.init_mode && !secret_path.exists() {
        info!("init mode: generating agent key material");
        if let Some(parent) = secret_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| KeyError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let keys = PrivateKeyFile::generate(Uuid::new_v4());
        keys.save(&secret_path)?;
        let root_block = RootBlockFile::generate(&keys)?;
        root_block.save(&rootblock_path)?;
    }

    let keys = PrivateKeyFile::load(&secret_path)?;
    let root_block = RootBlockFile::load(&rootblock_path)?;
    Ok((keys, root_block))
}

/// Shapes the capability set of one data-service instance for its
/// consumer: create the root context, install the root block, then reduce
/// the root capabilities so the consumer can never exceed its role.
fn configure_data_instance(
    sock: &mut UnixStream,
    conf: &AgentConfig,
    root_block: &RootBlockFile,
    caps: &crate::bitcap::Bitcap,
) -> Result<(), SupervisorError> {
    data_control::root_context_create(
        sock,
        conf.database_max_size,
        &conf.datastore.display().to_string(),
        &root_block.cert,
    )?;
    data_control::root_context_reduce_caps(sock, caps)?;
    Ok(())
}

fn initialize_auth_service(
    sock: &mut UnixStream,
    keys: &PrivateKeyFile,
) -> Result<(), SupervisorError> {
    let request = authservice::encode_initialize(
        0,
        keys.entity_id,
        keys.agreement.public().as_bytes(),
        &keys.agreement.secret_bytes(),
    );
    frame::write_data(sock, &request).map_err(|_| SupervisorError::AuthSetup)?;
    let raw = frame::read_data(sock).map_err(|_| SupervisorError::AuthSetup)?;
    if raw.len() < 12 || BigEndian::read_u32(&raw[8..12]) != STATUS_SUCCESS {
        return Err(SupervisorError::AuthSetup);
    }
    Ok(())
}

fn key32(hex_text: &str, what: &str) -> Result<[u8; 32], SupervisorError> {
    let bytes = hex::decode(hex_text)
        .map_err(|_| SupervisorError::InvalidView(format!("{} is not hex", what)))?;
    if bytes.len() != 32 {
        return Err(SupervisorError::InvalidView(format!(
            "{} must be 32 bytes",
            what
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Installs the authorized entities and their capability triples from the
/// configured views, then finalizes the protocol service.
fn configure_protocol_service(
    sock: &mut UnixStream,
    conf: &AgentConfig,
    keys: &PrivateKeyFile,
) -> Result<(), SupervisorError> {
    protocol_control::private_key_set(sock, keys.entity_id, &keys.agreement.secret_bytes())?;

    for view in &conf.view {
        let encryption = key32(&view.encryption_key, "encryption_key")?;
        let signing = key32(&view.signing_key, "signing_key")?;
        protocol_control::auth_entity_add(sock, view.entity, &encryption, &signing)?;

        for grant in &view.grants {
            let verb = verb_by_name(&grant.verb).ok_or_else(|| {
                SupervisorError::InvalidView(format!("unknown verb `{}`", grant.verb))
            })?;
            let object = grant.object.unwrap_or_else(zero_id);
            protocol_control::capability_add(sock, view.entity, verb, object)?;
        }
    }

    protocol_control::finalize(sock)?;
    Ok(())
}

/// Runs the supervisor until shutdown. This is the `start` command.
pub fn run(bconf: &BootstrapConfig, conf: &AgentConfig) -> Result<(), SupervisorError> {
    let runsecure = Uid::effective().is_root();
    if !runsecure {
        warn!("not running as root; privilege separation is disabled");
    }

    let (keys, root_block) = load_key_material(bconf, conf)?;
    info!("agent entity {}", keys.entity_id);

    // Signals are owned by a dedicated thread from here on.
    signalthread::block_termination_signals()
        .map_err(|err| SupervisorError::Signal(std::io::Error::from(err)))?;
    let mut signal_sock = signalthread::spawn().map_err(SupervisorError::Signal)?;

    let listener = std::net::TcpListener::bind(&conf.listen[..]).map_err(SupervisorError::Bind)?;
    info!("listening on {:?}", listener.local_addr().ok());

    let usergroup = &conf.usergroup;
    let mut children: Vec<ServiceProcess> = Vec::new();
    let mut log_drains = Vec::new();
    let ctx = SpawnContext {
        bconf,
        usergroup,
        runsecure,
    };

    // Leaf services first: random, auth, the data instances, notification.
    let (random_for_protocol, random_child) = stream_pair().map_err(spawn_err(Role::Random))?;
    let (random_log, random_log_child) = stream_pair().map_err(spawn_err(Role::Random))?;
    ctx.spawn(
        Role::Random,
        &[
            (random_log_child.raw(), fd::random::LOG),
            (random_child.raw(), fd::random::CONTROL),
        ],
        fd::random::HIGHEST,
        &mut children,
    )?;
    drop(random_child);
    log_drains.push((random_log, "random"));

    let (mut auth_sock, auth_child) = stream_pair().map_err(spawn_err(Role::Auth))?;
    let (auth_log, auth_log_child) = stream_pair().map_err(spawn_err(Role::Auth))?;
    ctx.spawn(
        Role::Auth,
        &[
            (auth_log_child.raw(), fd::auth::LOG),
            (auth_child.raw(), fd::auth::CONTROL),
        ],
        fd::auth::HIGHEST,
        &mut children,
    )?;
    drop(auth_child);
    log_drains.push((auth_log, "auth"));

    let mut data_socks = Vec::new();
    for role in [
        Role::DataForAttestation,
        Role::DataForCanonization,
        Role::DataForProtocol,
    ]
    .iter()
    {
        let (sock, child_end) = stream_pair().map_err(spawn_err(*role))?;
        let (log_sock, log_child) = stream_pair().map_err(spawn_err(*role))?;
        ctx.spawn(
            *role,
            &[
                (log_child.raw(), fd::data::LOG),
                (child_end.raw(), fd::data::CONTROL),
            ],
            fd::data::HIGHEST,
            &mut children,
        )?;
        drop(child_end);
        log_drains.push((log_sock, role.name()));
        data_socks.push(sock);
    }
    let mut data_proto_sock = data_socks.pop().expect("three data instances");
    let mut data_canon_sock = data_socks.pop().expect("three data instances");
    let mut data_att_sock = data_socks.pop().expect("three data instances");

    let (notify_canon_end, notify_canon_child) =
        fd_pair().map_err(spawn_err(Role::Notification))?;
    let (notify_proto_end, notify_proto_child) =
        fd_pair().map_err(spawn_err(Role::Notification))?;
    let (notify_log, notify_log_child) = stream_pair().map_err(spawn_err(Role::Notification))?;
    ctx.spawn(
        Role::Notification,
        &[
            (notify_log_child.raw(), fd::notification::LOG),
            (notify_canon_child.raw(), fd::notification::CLIENT1),
            (notify_proto_child.raw(), fd::notification::CLIENT2),
        ],
        fd::notification::HIGHEST,
        &mut children,
    )?;
    drop(notify_canon_child);
    drop(notify_proto_child);
    log_drains.push((notify_log, "notification"));

    // Configure each data instance for its consumer before any consumer
    // can speak to it.
    configure_data_instance(
        &mut data_att_sock,
        conf,
        &root_block,
        &attestationservice::attestation_caps(),
    )?;
    configure_data_instance(
        &mut data_canon_sock,
        conf,
        &root_block,
        &canonization_round_caps(),
    )?;
    configure_data_instance(
        &mut data_proto_sock,
        conf,
        &root_block,
        &protocolservice::protocol_data_caps(),
    )?;

    initialize_auth_service(&mut auth_sock, &keys)?;

    // Consumers: attestation, then canonization.
    // The attestation control socket stays open for the tree's lifetime;
    // the service treats its closure as a shutdown signal.
    let (_att_ctrl, att_ctrl_child) = stream_pair().map_err(spawn_err(Role::Attestation))?;
    let (att_log, att_log_child) = stream_pair().map_err(spawn_err(Role::Attestation))?;
    let data_att_fd = data_att_sock.into_raw_fd();
    ctx.spawn(
        Role::Attestation,
        &[
            (att_log_child.raw(), fd::attestation::LOG),
            (att_ctrl_child.raw(), fd::attestation::CONTROL),
            (data_att_fd, fd::attestation::DATA),
        ],
        fd::attestation::HIGHEST,
        &mut children,
    )?;
    drop(att_ctrl_child);
    close_raw(data_att_fd);
    log_drains.push((att_log, "attestation"));

    let (mut canon_ctrl, canon_ctrl_child) =
        stream_pair().map_err(spawn_err(Role::Canonization))?;
    let (canon_log, canon_log_child) = stream_pair().map_err(spawn_err(Role::Canonization))?;
    let data_canon_fd = data_canon_sock.into_raw_fd();
    let notify_canon_fd = notify_canon_end.into_raw();
    ctx.spawn(
        Role::Canonization,
        &[
            (canon_log_child.raw(), fd::canonization::LOG),
            (canon_ctrl_child.raw(), fd::canonization::CONTROL),
            (data_canon_fd, fd::canonization::DATA),
            (notify_canon_fd, fd::canonization::NOTIFY),
        ],
        fd::canonization::HIGHEST,
        &mut children,
    )?;
    drop(canon_ctrl_child);
    close_raw(data_canon_fd);
    close_raw(notify_canon_fd);
    log_drains.push((canon_log, "canonization"));

    canonization_control::configure(
        &mut canon_ctrl,
        conf.block_max_milliseconds,
        conf.block_max_transactions,
    )?;
    canonization_control::private_key_set(
        &mut canon_ctrl,
        keys.entity_id,
        &keys.signing.to_bytes(),
    )?;
    canonization_control::start(&mut canon_ctrl)?;

    // Protocol service last, with the full socket fan.
    let (mut proto_ctrl, proto_ctrl_child) = stream_pair().map_err(spawn_err(Role::Protocol))?;
    let (proto_log, proto_log_child) = stream_pair().map_err(spawn_err(Role::Protocol))?;
    let random_fd = random_for_protocol.into_raw_fd();
    let accept_fd = listener.into_raw_fd();
    let data_proto_fd = data_proto_sock.into_raw_fd();
    let notify_proto_fd = notify_proto_end.into_raw();
    ctx.spawn(
        Role::Protocol,
        &[
            (proto_log_child.raw(), fd::protocol::LOG),
            (proto_ctrl_child.raw(), fd::protocol::CONTROL),
            (random_fd, fd::protocol::RANDOM),
            (accept_fd, fd::protocol::ACCEPT),
            (data_proto_fd, fd::protocol::DATA),
            (notify_proto_fd, fd::protocol::NOTIFY),
        ],
        fd::protocol::HIGHEST,
        &mut children,
    )?;
    drop(proto_ctrl_child);
    close_raw(random_fd);
    close_raw(accept_fd);
    close_raw(data_proto_fd);
    close_raw(notify_proto_fd);
    log_drains.push((proto_log, "protocol"));

    configure_protocol_service(&mut proto_ctrl, conf, &keys)?;
    info!("all services running");

    // Children are wired; start republishing their logs.
    for (sock, name) in log_drains {
        spawn_log_drain(sock, name);
    }

    let result = monitor(&mut signal_sock, &children);
    shutdown(&children);
    result
}

struct SpawnContext<'a> {
    bconf: &'a BootstrapConfig,
    usergroup: &'a crate::config::UserGroup,
    runsecure: bool,
}

impl SpawnContext<'_> {
    fn spawn(
        &self,
        role: Role,
        fd_map: &[(RawFd, RawFd)],
        highest: RawFd,
        children: &mut Vec<ServiceProcess>,
    ) -> Result<(), SupervisorError> {
        let child = spawn_service(
            self.bconf,
            self.usergroup,
            role,
            fd_map,
            highest,
            self.runsecure,
        )
        .map_err(|source| SupervisorError::Spawn {
            role: role.name(),
            source,
        })?;
        info!("spawned {} as pid {}", role.name(), child.pid);
        children.push(child);
        Ok(())
    }
}

fn spawn_err(role: Role) -> impl Fn(SpawnError) -> SupervisorError {
    move |source| SupervisorError::Spawn {
        role: role.name(),
        source,
    }
}

fn close_raw(fd: i32) {
    let _ = nix::unistd::close(fd);
}

fn canonization_round_caps() -> crate::bitcap::Bitcap {
    crate::canonizationservice::CanonizationService::round_caps()
}

/// Waits for a termination signal or a child death.
fn monitor(
    signal_sock: &mut UnixStream,
    children: &[ServiceProcess],
) -> Result<(), SupervisorError> {
    loop {
        let mut poll_fds = [PollFd::new(signal_sock.as_raw_fd(), PollFlags::POLLIN)];
        let _ = poll(&mut poll_fds, 500);

        if poll_fds[0]
            .revents()
            .map(|flags| flags.contains(PollFlags::POLLIN))
            .unwrap_or(false)
        {
            let mut byte = [0u8; 1];
            if signal_sock.read_exact(&mut byte).is_ok() {
                match SignalState::from_byte(byte[0]) {
                    Some(SignalState::Terminate) => {
                        info!("termination signal; shutting down the tree");
                        return Ok(());
                    }
                    Some(SignalState::Quiesce) => {
                        info!("quiesce signal; shutting down the tree");
                        return Ok(());
                    }
                    None => {}
                }
            } else {
                return Ok(());
            }
        }

        // Reap any dead child; losing one tears the tree down, with the
        // exit status reflecting how critical the role was.
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(pid, code)) => {
                let role = role_of(children, pid);
                warn!("{} (pid {}) exited with code {}", role, pid, code);
                return lost(role, children, pid);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                let role = role_of(children, pid);
                warn!("{} (pid {}) killed by {}", role, pid, signal);
                return lost(role, children, pid);
            }
            Ok(_) => {}
            Err(nix::Error::ECHILD) => return Ok(()),
            Err(_) => {}
        }
    }
}

fn role_of(children: &[ServiceProcess], pid: nix::unistd::Pid) -> &'static str {
    children
        .iter()
        .find(|child| child.pid == pid)
        .map(|child| child.role.name())
        .unwrap_or("unknown")
}

fn lost(
    role: &'static str,
    children: &[ServiceProcess],
    pid: nix::unistd::Pid,
) -> Result<(), SupervisorError> {
    let fatal = children
        .iter()
        .find(|child| child.pid == pid)
        .map(|child| child.role.fatal_on_loss())
        .unwrap_or(true);
    if fatal {
        Err(SupervisorError::CriticalChildLost(role))
    } else {
        Ok(())
    }
}

/// SIGTERM to every child, a grace period, then SIGKILL for stragglers.
fn shutdown(children: &[ServiceProcess]) {
    for child in children {
        let _ = kill(child.pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    let mut remaining: Vec<_> = children.iter().map(|child| child.pid).collect();
    while !remaining.is_empty() && Instant::now() < deadline {
        remaining.retain(|pid| {
            !matches!(
                waitpid(*pid, Some(WaitPidFlag::WNOHANG)),
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(nix::Error::ECHILD)
            )
        });
        if !remaining.is_empty() {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    for pid in &remaining {
        warn!("pid {} did not exit in time; killing", pid);
        let _ = kill(*pid, Signal::SIGKILL);
        let _ = waitpid(*pid, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_the_chroot() {
        assert_eq!(
            resolve_under(Path::new("/opt/agent"), Path::new("root/secret.cert")),
            PathBuf::from("/opt/agent/root/secret.cert")
        );
        assert_eq!(
            resolve_under(Path::new("/opt/agent"), Path::new("/etc/other.cert")),
            PathBuf::from("/etc/other.cert")
        );
    }

    #[test]
    fn bad_view_keys_are_rejected() {
        assert!(key32("zz", "encryption_key").is_err());
        assert!(key32("00ff", "encryption_key").is_err());
        assert!(key32(&"ab".repeat(32), "encryption_key").is_ok());
    }
}
