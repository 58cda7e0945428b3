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

//! The canonization service.
//!
//! A timer drives one round every `block_max_milliseconds`: open a child
//! context on the data service, read the chain head, collect promoted
//! transactions off the process queue up to the batch cap, build and sign
//! a block certificate, commit it with `block_make`, announce the new head
//! to the notification service, close the child context. Any non-success
//! anywhere aborts the round back to idle; the timer keeps firing.

pub mod api;

use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::bitcap::Bitcap;
use crate::cert::{cert_type, field, Certificate, CertificateBuilder};
use crate::crypto::SigningKey;
use crate::dataservice::api::{ApiError as DataApiError, DataApi};
use crate::dataservice::method::cap as data_cap;
use crate::dataservice::records::TransactionState;
use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::notificationservice::api::NotifyApi;
use crate::notificationservice::method::cap as notify_cap;
use crate::signalthread::SignalState;
use crate::status::{self, data as data_status, STATUS_SUCCESS};
use crate::Id;

use self::api::{decode_request, encode_response, ControlMethod};

/// Reserved offset for this service's own block-update announcements.
pub const BLOCK_UPDATE_OFFSET: u64 = 7474;

/// Where a round currently is. Transitions run top to bottom; any failure
/// resets to `Idle` after closing an open child context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    WaitChildContext,
    WaitLatestBlockId,
    WaitPrevBlock,
    WaitTxnFirst,
    WaitTxnNext,
    Building,
    WaitBlockMake,
    WaitNotify,
    WaitChildContextClose,
}

/// Outcome of one timer round.
#[derive(Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The queue held nothing promotable; no block was made.
    Dry,
    /// A block was committed and announced.
    Canonized { block_id: Id, transactions: usize },
}

#[derive(Debug, Clone, Copy)]
struct RoundConfig {
    block_max_milliseconds: u64,
    block_max_transactions: u32,
}

/// The canonization state machine.
pub struct CanonizationService {
    state: State,
    config: Option<RoundConfig>,
    signer: Option<(Id, SigningKey)>,
    started: bool,
    force_exit: bool,
}

impl std::fmt::Debug for CanonizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonizationService")
            .field("state", &self.state)
            .field("started", &self.started)
            .field("force_exit", &self.force_exit)
            .finish()
    }
}

impl Default for CanonizationService {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonizationService {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            config: None,
            signer: None,
            started: false,
            force_exit: false,
        }
    }

    /// The current round state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether `Start` has been accepted.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Records a terminate request; no new I/O is started afterwards.
    pub fn force_exit(&mut self) {
        self.force_exit = true;
    }

    /// Handles one control request, returning the response frame.
    pub fn handle_control(&mut self, raw: &[u8]) -> Vec<u8> {
        let request = match decode_request(raw) {
            Some(request) => request,
            None => {
                return encode_response(
                    0,
                    0,
                    status::canonization::REQUEST_PACKET_INVALID_SIZE,
                );
            }
        };
        let method = match ControlMethod::from_u32(request.method) {
            Some(method) => method,
            None => {
                return encode_response(
                    request.method,
                    request.offset,
                    status::canonization::INVALID_REQUEST_ID,
                );
            }
        };

        let status = match method {
            ControlMethod::Configure => match api::decode_configure(&request.payload) {
                Some((milliseconds, transactions))
                    if milliseconds > 0 && transactions > 0 && !self.started =>
                {
                    if self.config.is_some() {
                        status::canonization::ALREADY_CONFIGURED
                    } else {
                        self.config = Some(RoundConfig {
                            block_max_milliseconds: milliseconds,
                            block_max_transactions: transactions,
                        });
                        STATUS_SUCCESS
                    }
                }
                Some(_) => status::canonization::ALREADY_CONFIGURED,
                None => status::canonization::REQUEST_PACKET_INVALID_SIZE,
            },
            ControlMethod::PrivateKeySet => match api::decode_private_key(&request.payload) {
                Some((entity_id, key_bytes)) => {
                    self.signer = Some((entity_id, SigningKey::from_bytes(&key_bytes)));
                    STATUS_SUCCESS
                }
                None => status::canonization::REQUEST_PACKET_INVALID_SIZE,
            },
            ControlMethod::Start => {
                if self.started {
                    status::canonization::ALREADY_STARTED
                } else if self.config.is_none() {
                    status::canonization::NOT_CONFIGURED
                } else if self.signer.is_none() {
                    status::canonization::PRIVATE_KEY_MISSING
                } else {
                    self.started = true;
                    STATUS_SUCCESS
                }
            }
        };
        encode_response(request.method, request.offset, status)
    }

    /// The child-context capability set one round needs, and nothing more.
    pub fn round_caps() -> Bitcap {
        let mut caps = Bitcap::new_false(data_cap::BITS);
        caps.set(data_cap::CHILD_CONTEXT_CREATE, true);
        caps.set(data_cap::CHILD_CONTEXT_CLOSE, true);
        caps.set(data_cap::BLOCK_ID_LATEST_READ, true);
        caps.set(data_cap::BLOCK_READ, true);
        caps.set(data_cap::PQ_TRANSACTION_FIRST_READ, true);
        caps.set(data_cap::PQ_TRANSACTION_READ, true);
        caps.set(data_cap::BLOCK_WRITE, true);
        caps
    }

    /// Runs one canonization round.
    pub async fn run_round(
        &mut self,
        data: &mut DataApi,
        notify: &mut NotifyApi,
    ) -> Result<RoundOutcome, DataApiError> {
        self.state = State::WaitChildContext;
        let child = data.child_context_create(&Self::round_caps()).await?;

        let result = self.round_body(child, data, notify).await;

        // The child context closes on every exit path; a close failure
        // only surfaces when the round itself succeeded.
        self.state = State::WaitChildContextClose;
        let close_result = data.child_context_close(child).await;
        self.state = State::Idle;
        match (result, close_result) {
            (Err(err), _) => Err(err),
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    async fn round_body(
        &mut self,
        child: u32,
        data: &mut DataApi,
        notify: &mut NotifyApi,
    ) -> Result<RoundOutcome, DataApiError> {
        let config = self.config.expect("round requires configuration");
        let (signer_id, _) = self.signer.as_ref().expect("round requires a signer");
        let signer_id = *signer_id;

        self.state = State::WaitLatestBlockId;
        let latest_id = data.block_id_latest_read(child).await?;

        self.state = State::WaitPrevBlock;
        let latest_block = data.block_read(child, latest_id, true).await?;

        // Drain the queue front-to-back, keeping promoted transactions.
        self.state = State::WaitTxnFirst;
        let mut batch = Vec::new();
        let mut cursor = match data.transaction_get_first(child).await {
            Ok(record) => Some(record),
            Err(DataApiError::Status(status)) if status == data_status::NOT_FOUND => None,
            Err(err) => return Err(err),
        };
        while let Some(record) = cursor {
            if batch.len() >= config.block_max_transactions as usize {
                break;
            }
            let next = record.next;
            if record.state == TransactionState::Promoted {
                batch.push(record);
            }
            if next == crate::zero_id() {
                break;
            }
            self.state = State::WaitTxnNext;
            cursor = Some(data.transaction_get(child, next).await?);
        }

        if batch.is_empty() {
            return Ok(RoundOutcome::Dry);
        }

        // Assemble and sign the block certificate.
        self.state = State::Building;
        let block_id = Uuid::new_v4();
        let mut builder = CertificateBuilder::new(cert_type::BLOCK);
        builder
            .push_id(field::BLOCK_ID, block_id)
            .push_id(field::PREVIOUS_BLOCK_ID, latest_id)
            .push_u64(field::BLOCK_HEIGHT, latest_block.height + 1);
        if let Ok(prev_cert) = Certificate::parse(&latest_block.cert) {
            if let Ok(signature) = prev_cert.signature_bytes() {
                builder.push(field::PREVIOUS_BLOCK_SIGNATURE, signature);
            }
        }
        for record in &batch {
            builder.push(field::WRAPPED_TRANSACTION, &record.cert);
        }
        let (_, signing_key) = self.signer.as_ref().expect("checked above");
        let block_cert = builder
            .sign(signer_id, signing_key)
            .map_err(|_| DataApiError::Malformed)?;

        self.state = State::WaitBlockMake;
        data.block_make(child, block_id, &block_cert).await?;

        self.state = State::WaitNotify;
        notify
            .block_update(BLOCK_UPDATE_OFFSET, block_id)
            .await
            .map_err(|_| DataApiError::Closed)?;

        Ok(RoundOutcome::Canonized {
            block_id,
            transactions: batch.len(),
        })
    }
}

/// Serves the canonization service: control phase, then the timer loop.
pub async fn run(
    control: tokio::net::UnixStream,
    data: tokio::net::UnixStream,
    notify: tokio::net::UnixStream,
    mut signal: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut service = CanonizationService::new();
    let mut control = Framed::new(control, IpcCodec::new());
    let mut data = DataApi::new(data);
    let mut notify = NotifyApi::new(notify);
    let mut signal_byte = [0u8; 1];

    // Control phase: the supervisor configures and starts us.
    info!("canonization service awaiting configuration");
    while !service.started() {
        tokio::select! {
            frame = control.next() => {
                let request = match frame {
                    Some(Ok(Packet::Data(request))) => request,
                    Some(Ok(_)) | Some(Err(_)) => anyhow::bail!("control socket failure"),
                    None => return Ok(()),
                };
                let response = service.handle_control(&request);
                control.send(Packet::Data(response)).await?;
            }
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {
                        if SignalState::from_byte(signal_byte[0])
                            == Some(SignalState::Terminate)
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // This side of the notification service only ever announces.
    let mut notify_caps = Bitcap::new_false(notify_cap::BITS);
    notify_caps.set(notify_cap::BLOCK_UPDATE, true);
    if let Err(err) = notify.reduce_caps(0, &notify_caps).await {
        anyhow::bail!("cannot reduce notification capabilities: {}", err);
    }

    let period = service
        .config
        .expect("started implies configured")
        .block_max_milliseconds;
    let mut timer = interval(Duration::from_millis(period));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("canonization service started: one round per {} ms", period);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if service.force_exit {
                    break;
                }
                match service.run_round(&mut data, &mut notify).await {
                    Ok(RoundOutcome::Dry) => {}
                    Ok(RoundOutcome::Canonized { block_id, transactions }) => {
                        info!(
                            "canonized block {} with {} transaction(s)",
                            block_id, transactions
                        );
                    }
                    Err(DataApiError::Status(status)) => {
                        warn!("canonization round aborted: status {:#010x}", status);
                    }
                    Err(err) => {
                        warn!("canonization transport failure: {}", err);
                        anyhow::bail!(err);
                    }
                }
            }
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if SignalState::from_byte(signal_byte[0])
                            == Some(SignalState::Terminate)
                        {
                            info!("terminate signal; finishing in-flight round state");
                            service.force_exit();
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonizationservice::api::{encode_configure, encode_private_key};
    use byteorder::{BigEndian, ByteOrder};

    fn control_request(method: ControlMethod, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(method as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn status_of(resp: &[u8]) -> u32 {
        BigEndian::read_u32(&resp[8..12])
    }

    #[test]
    fn start_requires_configure_and_key() {
        let mut service = CanonizationService::new();

        let resp = service.handle_control(&control_request(ControlMethod::Start, &[]));
        assert_eq!(status_of(&resp), status::canonization::NOT_CONFIGURED);

        let resp = service.handle_control(&control_request(
            ControlMethod::Configure,
            &encode_configure(5000, 500),
        ));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);

        let resp = service.handle_control(&control_request(ControlMethod::Start, &[]));
        assert_eq!(status_of(&resp), status::canonization::PRIVATE_KEY_MISSING);

        let resp = service.handle_control(&control_request(
            ControlMethod::PrivateKeySet,
            &encode_private_key(Uuid::new_v4(), &[1u8; 32]),
        ));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);

        let resp = service.handle_control(&control_request(ControlMethod::Start, &[]));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);
        assert!(service.started());

        let resp = service.handle_control(&control_request(ControlMethod::Start, &[]));
        assert_eq!(status_of(&resp), status::canonization::ALREADY_STARTED);
    }

    #[test]
    fn configure_twice_fails() {
        let mut service = CanonizationService::new();
        service.handle_control(&control_request(
            ControlMethod::Configure,
            &encode_configure(1000, 10),
        ));
        let resp = service.handle_control(&control_request(
            ControlMethod::Configure,
            &encode_configure(2000, 20),
        ));
        assert_eq!(status_of(&resp), status::canonization::ALREADY_CONFIGURED);
    }

    #[test]
    fn malformed_control_rejected() {
        let mut service = CanonizationService::new();
        let resp = service.handle_control(&control_request(ControlMethod::Configure, &[1, 2]));
        assert_eq!(
            status_of(&resp),
            status::canonization::REQUEST_PACKET_INVALID_SIZE
        );

        let resp = service.handle_control(&[0, 0, 0, 9, 0, 0, 0, 0]);
        assert_eq!(status_of(&resp), status::canonization::INVALID_REQUEST_ID);
    }

    #[test]
    fn round_caps_are_minimal() {
        let caps = CanonizationService::round_caps();
        assert!(caps.is_set(data_cap::BLOCK_WRITE));
        assert!(caps.is_set(data_cap::PQ_TRANSACTION_FIRST_READ));
        assert!(!caps.is_set(data_cap::PQ_TRANSACTION_SUBMIT));
        assert!(!caps.is_set(data_cap::GLOBAL_SETTING_WRITE));
        assert!(!caps.is_set(data_cap::PQ_TRANSACTION_DROP));
    }
}
