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

//! Bootstrap configuration.
//!
//! Built once from the command line before anything else runs, immutable
//! afterward. The private `-P` flag is how the supervisor re-enters this
//! binary as a specific service after fork; it never appears in user-facing
//! help output.

use clap::{App, Arg};
use thiserror::Error;

use std::path::PathBuf;

use crate::path;

/// Default config file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/agentd.conf";

/// Public commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    ReadConfig,
    Version,
    /// An unrecognized command line; prints usage and exits non-zero.
    ErrorUsage,
}

/// Private service entry points, selected with `-P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivateCommand {
    RandomService,
    AuthService,
    DataService,
    NotificationService,
    CanonizationService,
    AttestationService,
    ProtocolService,
}

impl PrivateCommand {
    /// The `-P` argument naming this entry point.
    pub fn name(self) -> &'static str {
        match self {
            PrivateCommand::RandomService => "random_service",
            PrivateCommand::AuthService => "auth_service",
            PrivateCommand::DataService => "data_service",
            PrivateCommand::NotificationService => "notification_service",
            PrivateCommand::CanonizationService => "canonization_service",
            PrivateCommand::AttestationService => "attestation_service",
            PrivateCommand::ProtocolService => "protocol_service",
        }
    }

    /// Resolves a `-P` argument.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "random_service" => PrivateCommand::RandomService,
            "auth_service" => PrivateCommand::AuthService,
            "data_service" => PrivateCommand::DataService,
            "notification_service" => PrivateCommand::NotificationService,
            "canonization_service" => PrivateCommand::CanonizationService,
            "attestation_service" => PrivateCommand::AttestationService,
            "protocol_service" => PrivateCommand::ProtocolService,
            _ => return None,
        })
    }
}

/// Errors raised while building the bootstrap record.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cannot parse command line: {0}")]
    BadCommandLine(String),
    #[error("unknown private command `{0}`")]
    UnknownPrivateCommand(String),
    #[error(transparent)]
    Binary(#[from] path::PathError),
}

/// The bootstrap configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapConfig {
    pub foreground: bool,
    pub init_mode: bool,
    pub command: Command,
    pub private_command: Option<PrivateCommand>,
    pub config_file: PathBuf,
    pub config_file_override: bool,
    /// The chroot target for privilege-separated children.
    pub prefix_dir: PathBuf,
    /// Absolute path of this binary, re-executed for private commands.
    pub binary: PathBuf,
}

impl BootstrapConfig {
    /// Parses `args` (including `argv[0]`) into a bootstrap record.
    ///
    /// `search_path` is consulted to resolve `argv[0]` into an absolute
    /// binary path; the prefix directory is the parent of the binary's
    /// directory.
    pub fn from_args(args: &[String], search_path: &str) -> Result<Self, BootstrapError> {
        let app = App::new("agentd")
            .about("blockchain agent daemon")
            .arg(
                Arg::with_name("foreground")
                    .short("F")
                    .help("Run in the foreground; do not daemonize"),
            )
            .arg(
                Arg::with_name("config")
                    .short("c")
                    .takes_value(true)
                    .help("Override the config file location"),
            )
            .arg(
                Arg::with_name("init")
                    .short("I")
                    .help("Initialization mode"),
            )
            .arg(
                Arg::with_name("private")
                    .short("P")
                    .takes_value(true)
                    .hidden(true),
            )
            .arg(Arg::with_name("command").index(1));

        let matches = app
            .get_matches_from_safe(args)
            .map_err(|err| BootstrapError::BadCommandLine(err.message))?;

        let binary = path::resolve(&args[0], &path::append_default(search_path))?;
        let prefix_dir = binary
            .parent()
            .and_then(std::path::Path::parent)
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let private_command = match matches.value_of("private") {
            Some(name) => Some(
                PrivateCommand::from_name(name)
                    .ok_or_else(|| BootstrapError::UnknownPrivateCommand(name.to_owned()))?,
            ),
            None => None,
        };

        let command = match matches.value_of("command") {
            None if private_command.is_some() => Command::Start,
            None => Command::Help,
            Some("start") => Command::Start,
            Some("help") => Command::Help,
            Some("readconfig") => Command::ReadConfig,
            Some("version") => Command::Version,
            Some(_) => Command::ErrorUsage,
        };

        let (config_file, config_file_override) = match matches.value_of("config") {
            Some(path) => (PathBuf::from(path), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        Ok(Self {
            foreground: matches.is_present("foreground"),
            init_mode: matches.is_present("init"),
            command,
            private_command,
            config_file,
            config_file_override,
            prefix_dir,
            binary,
        })
    }
}
