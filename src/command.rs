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

//! Command dispatch.
//!
//! Public commands come from the operator (`start`, `readconfig`,
//! `version`, `help`); private commands are how a freshly exec'd child
//! becomes a service. A private entry point adopts the fixed descriptors
//! privsep left behind, wires logging through the log socket, and runs
//! the service's event loop on a single-threaded runtime.

use log::error;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use std::os::unix::io::{FromRawFd, RawFd};

use crate::bootstrap::{BootstrapConfig, Command, PrivateCommand};
use crate::config::AgentConfig;
use crate::logger;
use crate::signalthread;
use crate::status::{self, exit_code, ServiceKind, StatusWord};
use crate::{
    attestationservice, authservice, canonizationservice, dataservice, fd, notificationservice,
    protocolservice, randomservice, supervisor,
};

/// Environment variable carrying the configured loglevel across exec.
pub const LOGLEVEL_ENV: &str = "AGENTD_LOGLEVEL";

const USAGE: &str = "\
Usage: agentd [-F] [-I] [-c config] command

Commands:
    start        start the agent daemon
    readconfig   parse and display the configuration
    version      display the agentd version
    help         display this message

Options:
    -F           run in the foreground
    -I           initialization mode: create missing key material
    -c <path>    override the config file location
";

/// Runs the selected command, returning the process exit code.
pub fn dispatch(bconf: &BootstrapConfig) -> i32 {
    if let Some(private) = bconf.private_command {
        return private_entry(bconf, private);
    }

    match bconf.command {
        Command::Help => {
            print!("{}", USAGE);
            0
        }
        Command::Version => {
            println!("agentd {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Command::ReadConfig => read_config(bconf),
        Command::Start => start(bconf),
        Command::ErrorUsage => {
            eprint!("{}", USAGE);
            exit_code(status::general::BAD_ARGUMENT)
        }
    }
}

fn load_config(bconf: &BootstrapConfig) -> Result<AgentConfig, StatusWord> {
    if !bconf.config_file_override && !bconf.config_file.exists() {
        // No config file installed: run on defaults.
        return Ok(AgentConfig::default());
    }
    AgentConfig::load(&bconf.config_file).map_err(|err| {
        eprintln!("agentd: {}", err);
        err.status()
    })
}

fn read_config(bconf: &BootstrapConfig) -> i32 {
    match load_config(bconf) {
        Ok(config) => {
            match toml::to_string_pretty(&config) {
                Ok(text) => print!("{}", text),
                Err(err) => {
                    eprintln!("agentd: cannot render config: {}", err);
                    return exit_code(status::config::INVALID_VALUE);
                }
            }
            0
        }
        Err(status) => exit_code(status),
    }
}

fn start(bconf: &BootstrapConfig) -> i32 {
    let conf = match load_config(bconf) {
        Ok(conf) => conf,
        Err(status) => return exit_code(status),
    };

    logger::init_foreground_logger(conf.loglevel);
    std::env::set_var(LOGLEVEL_ENV, conf.loglevel.to_string());

    if !bconf.foreground {
        if let Err(err) = nix::unistd::daemon(false, false) {
            eprintln!("agentd: cannot daemonize: {}", err);
            return exit_code(status::general::FORK_FAILURE);
        }
    }

    match supervisor::run(bconf, &conf) {
        Ok(()) => 0,
        Err(err) => {
            error!("supervisor failed: {}", err);
            exit_code(status::supervisor::CHILD_SETUP_FAILURE)
        }
    }
}

fn env_loglevel() -> u32 {
    std::env::var(LOGLEVEL_ENV)
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(4)
}

/// Adopts an inherited descriptor as a nonblocking Unix stream.
#[allow(unsafe_code)]
fn adopt_stream(fd: RawFd) -> std::io::Result<std::os::unix::net::UnixStream> {
    // SAFETY: privsep placed exactly this descriptor at this number; the
    // entry point is its only owner.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Adopts the inherited accept descriptor as a nonblocking TCP listener.
#[allow(unsafe_code)]
fn adopt_listener(fd: RawFd) -> std::io::Result<std::net::TcpListener> {
    // SAFETY: as above.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Adopts the log descriptor and installs the socket logger.
#[allow(unsafe_code)]
fn adopt_logging(fd: RawFd) {
    // SAFETY: as above.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    logger::init_service_logger(stream, env_loglevel());
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
}

/// Lets the default signal dispositions kill simple request/response
/// services; the mask was blocked before exec by the supervisor.
fn unblock_termination_signals() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGINT);
    let _ = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
}

fn service_failure(kind: ServiceKind, err: anyhow::Error) -> i32 {
    error!("service failed: {:#}", err);
    let _ = kind;
    exit_code(status::ipc::EVENT_LOOP_FAILURE)
}

fn private_entry(bconf: &BootstrapConfig, private: PrivateCommand) -> i32 {
    let _ = bconf;
    match private {
        PrivateCommand::RandomService => {
            unblock_termination_signals();
            adopt_logging(fd::random::LOG);
            run_on(ServiceKind::Random, |rt| {
                let control = adopt_stream(fd::random::CONTROL)?;
                rt.block_on(async {
                    let control = tokio::net::UnixStream::from_std(control)?;
                    randomservice::run(control).await
                })
            })
        }
        PrivateCommand::AuthService => {
            unblock_termination_signals();
            adopt_logging(fd::auth::LOG);
            run_on(ServiceKind::Auth, |rt| {
                let control = adopt_stream(fd::auth::CONTROL)?;
                rt.block_on(async {
                    let control = tokio::net::UnixStream::from_std(control)?;
                    authservice::run(control).await
                })
            })
        }
        PrivateCommand::DataService => {
            unblock_termination_signals();
            adopt_logging(fd::data::LOG);
            run_on(ServiceKind::Data, |rt| {
                let control = adopt_stream(fd::data::CONTROL)?;
                rt.block_on(async {
                    let control = tokio::net::UnixStream::from_std(control)?;
                    dataservice::dispatch::run(control).await
                })
            })
        }
        PrivateCommand::NotificationService => {
            adopt_logging(fd::notification::LOG);
            run_on(ServiceKind::Notification, |rt| {
                let client1 = adopt_stream(fd::notification::CLIENT1)?;
                let client2 = adopt_stream(fd::notification::CLIENT2)?;
                let signal = spawn_signal_thread()?;
                rt.block_on(async {
                    notificationservice::run(
                        tokio::net::UnixStream::from_std(client1)?,
                        tokio::net::UnixStream::from_std(client2)?,
                        tokio::net::UnixStream::from_std(signal)?,
                    )
                    .await
                })
            })
        }
        PrivateCommand::CanonizationService => {
            adopt_logging(fd::canonization::LOG);
            run_on(ServiceKind::Canonization, |rt| {
                let control = adopt_stream(fd::canonization::CONTROL)?;
                let data = adopt_stream(fd::canonization::DATA)?;
                let notify = adopt_stream(fd::canonization::NOTIFY)?;
                let signal = spawn_signal_thread()?;
                rt.block_on(async {
                    canonizationservice::run(
                        tokio::net::UnixStream::from_std(control)?,
                        tokio::net::UnixStream::from_std(data)?,
                        tokio::net::UnixStream::from_std(notify)?,
                        tokio::net::UnixStream::from_std(signal)?,
                    )
                    .await
                })
            })
        }
        PrivateCommand::AttestationService => {
            adopt_logging(fd::attestation::LOG);
            run_on(ServiceKind::Attestation, |rt| {
                let control = adopt_stream(fd::attestation::CONTROL)?;
                let data = adopt_stream(fd::attestation::DATA)?;
                let signal = spawn_signal_thread()?;
                rt.block_on(async {
                    attestationservice::run(
                        tokio::net::UnixStream::from_std(control)?,
                        tokio::net::UnixStream::from_std(data)?,
                        tokio::net::UnixStream::from_std(signal)?,
                    )
                    .await
                })
            })
        }
        PrivateCommand::ProtocolService => {
            adopt_logging(fd::protocol::LOG);
            run_on(ServiceKind::Protocol, |rt| {
                let control = adopt_stream(fd::protocol::CONTROL)?;
                let random = adopt_stream(fd::protocol::RANDOM)?;
                let accept = adopt_listener(fd::protocol::ACCEPT)?;
                let data = adopt_stream(fd::protocol::DATA)?;
                let notify = adopt_stream(fd::protocol::NOTIFY)?;
                let signal = spawn_signal_thread()?;
                rt.block_on(async {
                    protocolservice::run(
                        tokio::net::UnixStream::from_std(control)?,
                        tokio::net::UnixStream::from_std(random)?,
                        accept,
                        tokio::net::UnixStream::from_std(data)?,
                        tokio::net::UnixStream::from_std(notify)?,
                        tokio::net::UnixStream::from_std(signal)?,
                    )
                    .await
                })
            })
        }
    }
}

/// The signal mask is still blocked from before exec; route the signals
/// through a dedicated thread into a socket the event loop can poll.
fn spawn_signal_thread() -> std::io::Result<std::os::unix::net::UnixStream> {
    let _ = signalthread::block_termination_signals();
    let sock = signalthread::spawn()?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

fn run_on<F>(kind: ServiceKind, body: F) -> i32
where
    F: FnOnce(&tokio::runtime::Runtime) -> anyhow::Result<()>,
{
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(err) => return service_failure(kind, err.into()),
    };
    match body(&rt) {
        Ok(()) => 0,
        Err(err) => service_failure(kind, err),
    }
}
