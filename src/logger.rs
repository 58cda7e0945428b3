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

//! Logging plumbing.
//!
//! A chrooted service has no stderr; it logs through the log socket the
//! supervisor handed it, one STRING packet per record. The supervisor
//! drains every child's log socket on a thread and republishes the lines
//! through its own `env_logger` output, so operators see a single stream.

use log::{LevelFilter, Log, Metadata, Record};

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::thread;

use crate::ipc::frame;

/// Maps the configured 0..=9 loglevel onto a `log` filter.
pub fn level_filter(loglevel: u32) -> LevelFilter {
    match loglevel {
        0..=1 => LevelFilter::Error,
        2..=3 => LevelFilter::Warn,
        4..=5 => LevelFilter::Info,
        6..=7 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// `log::Log` implementation writing STRING packets to the log socket.
#[derive(Debug)]
pub struct SocketLogger {
    sock: Mutex<UnixStream>,
    filter: LevelFilter,
}

impl SocketLogger {
    pub fn new(sock: UnixStream, loglevel: u32) -> Self {
        Self {
            sock: Mutex::new(sock),
            filter: level_filter(loglevel),
        }
    }
}

impl Log for SocketLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{:<5} [{}] {}", record.level(), record.target(), record.args());
        if let Ok(mut sock) = self.sock.lock() {
            // A dead log socket must not take the service down with it.
            let _ = frame::write_string(&mut *sock, &line);
            let _ = sock.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut sock) = self.sock.lock() {
            let _ = sock.flush();
        }
    }
}

/// Installs a [`SocketLogger`] as the global logger for a service process.
pub fn init_service_logger(sock: UnixStream, loglevel: u32) {
    let filter = level_filter(loglevel);
    if log::set_boxed_logger(Box::new(SocketLogger::new(sock, loglevel))).is_ok() {
        log::set_max_level(filter);
    }
}

/// Installs the foreground logger used by the supervisor and by services
/// run outside secure mode.
pub fn init_foreground_logger(loglevel: u32) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level_filter(loglevel));
    let _ = builder.try_init();
}

/// Drains a child's log socket, republishing each record locally.
///
/// Returns the join handle; the thread exits when the peer closes.
pub fn spawn_log_drain(mut sock: UnixStream, service: &'static str) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match frame::read_string(&mut sock) {
            Ok(line) => log::info!(target: "agentd::child", "{}: {}", service, line),
            Err(_) => break,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_is_monotonic() {
        assert_eq!(level_filter(0), LevelFilter::Error);
        assert_eq!(level_filter(3), LevelFilter::Warn);
        assert_eq!(level_filter(4), LevelFilter::Info);
        assert_eq!(level_filter(7), LevelFilter::Debug);
        assert_eq!(level_filter(9), LevelFilter::Trace);
    }

    #[test]
    fn socket_logger_emits_string_packets() {
        let (writer, mut reader) = UnixStream::pair().unwrap();
        let logger = SocketLogger::new(writer, 9);

        logger.log(
            &Record::builder()
                .args(format_args!("canonization round complete"))
                .level(log::Level::Info)
                .target("agentd::canonizationservice")
                .build(),
        );

        let line = frame::read_string(&mut reader).unwrap();
        assert!(line.contains("canonization round complete"));
        assert!(line.contains("agentd::canonizationservice"));
    }

    #[test]
    fn records_above_filter_are_dropped() {
        let (writer, mut reader) = UnixStream::pair().unwrap();
        let logger = SocketLogger::new(writer, 0);

        logger.log(
            &Record::builder()
                .args(format_args!("chatty detail"))
                .level(log::Level::Debug)
                .target("agentd::dataservice")
                .build(),
        );
        drop(logger);

        assert!(frame::read_string(&mut reader).is_err());
    }
}
