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

//! The attestation service.
//!
//! Walks the process queue on a timer and promotes submitted transactions
//! whose certificates pass verification; certificates that fail are
//! dropped from the queue. Runs against the data service through a child
//! context restricted to exactly the queue-maintenance capability set.
//! Verification here is structural: the certificate must parse, carry the
//! mandatory transaction fields matching the queue record, and be signed.
//! Business validity is someone else's problem.

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::bitcap::Bitcap;
use crate::cert::{cert_type, field, Certificate};
use crate::crypto::SIGNATURE_LENGTH;
use crate::dataservice::api::{ApiError as DataApiError, DataApi};
use crate::dataservice::method::cap as data_cap;
use crate::dataservice::records::{TransactionRecord, TransactionState};
use crate::signalthread::SignalState;
use crate::status::data as data_status;
use crate::zero_id;

/// How often the queue is scanned.
pub const ATTESTATION_PERIOD_MILLISECONDS: u64 = 1000;

/// Outcome of one queue scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub promoted: usize,
    pub dropped: usize,
}

/// The capability set an attestation child context holds: create and close
/// the context, read blocks and transactions, promote, read and drop
/// queued transactions, read artifacts. Nothing else.
pub fn attestation_caps() -> Bitcap {
    let mut caps = Bitcap::new_false(data_cap::BITS);
    caps.set(data_cap::CHILD_CONTEXT_CREATE, true);
    caps.set(data_cap::CHILD_CONTEXT_CLOSE, true);
    caps.set(data_cap::BLOCK_READ, true);
    caps.set(data_cap::TRANSACTION_READ, true);
    caps.set(data_cap::PQ_TRANSACTION_PROMOTE, true);
    caps.set(data_cap::PQ_TRANSACTION_FIRST_READ, true);
    caps.set(data_cap::PQ_TRANSACTION_READ, true);
    caps.set(data_cap::PQ_TRANSACTION_DROP, true);
    caps.set(data_cap::ARTIFACT_READ, true);
    caps
}

/// Structural verification of a queued transaction certificate.
pub fn verify_transaction(record: &TransactionRecord) -> bool {
    let cert = match Certificate::parse(&record.cert) {
        Ok(cert) => cert,
        Err(_) => return false,
    };
    let type_ok = cert
        .require_id(field::CERTIFICATE_TYPE)
        .map(|id| id == cert_type::TRANSACTION)
        .unwrap_or(false);
    let id_ok = cert
        .require_id(field::CERTIFICATE_ID)
        .map(|id| id == record.transaction_id)
        .unwrap_or(false);
    let artifact_ok = cert
        .require_id(field::ARTIFACT_ID)
        .map(|id| id == record.artifact_id)
        .unwrap_or(false);
    let signer_ok = cert.require(field::ENTITY_ID).is_ok();
    let signature_ok = cert
        .require(field::SIGNATURE)
        .map(|sig| sig.len() == SIGNATURE_LENGTH)
        .unwrap_or(false);

    type_ok && id_ok && artifact_ok && signer_ok && signature_ok
}

/// Scans the queue once, promoting or dropping submitted transactions.
pub async fn scan_queue(data: &mut DataApi) -> Result<ScanOutcome, DataApiError> {
    let child = data.child_context_create(&attestation_caps()).await?;
    let result = scan_body(child, data).await;
    let close_result = data.child_context_close(child).await;
    match (result, close_result) {
        (Err(err), _) => Err(err),
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(err)) => Err(err),
    }
}

async fn scan_body(child: u32, data: &mut DataApi) -> Result<ScanOutcome, DataApiError> {
    let mut outcome = ScanOutcome::default();

    let mut cursor = match data.transaction_get_first(child).await {
        Ok(record) => Some(record),
        Err(DataApiError::Status(status)) if status == data_status::NOT_FOUND => None,
        Err(err) => return Err(err),
    };

    while let Some(record) = cursor {
        let next = record.next;

        if record.state == TransactionState::Submitted {
            if verify_transaction(&record) {
                data.transaction_promote(child, record.transaction_id).await?;
                outcome.promoted += 1;
            } else {
                debug!(
                    "dropping transaction {}: certificate failed verification",
                    record.transaction_id
                );
                data.transaction_drop(child, record.transaction_id).await?;
                outcome.dropped += 1;
            }
        }

        if next == zero_id() {
            break;
        }
        cursor = match data.transaction_get(child, next).await {
            Ok(record) => Some(record),
            // The neighbor may have been canonized between reads.
            Err(DataApiError::Status(status)) if status == data_status::NOT_FOUND => None,
            Err(err) => return Err(err),
        };
    }
    Ok(outcome)
}

/// Serves the attestation loop until the control socket closes or a
/// terminate signal arrives.
pub async fn run(
    mut control: tokio::net::UnixStream,
    data: tokio::net::UnixStream,
    mut signal: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut data = DataApi::new(data);
    let mut timer = interval(Duration::from_millis(ATTESTATION_PERIOD_MILLISECONDS));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signal_byte = [0u8; 1];
    let mut control_byte = [0u8; 1];

    info!("attestation service started");
    loop {
        tokio::select! {
            _ = timer.tick() => {
                match scan_queue(&mut data).await {
                    Ok(outcome) => {
                        if outcome.promoted > 0 || outcome.dropped > 0 {
                            info!(
                                "attestation scan: {} promoted, {} dropped",
                                outcome.promoted, outcome.dropped
                            );
                        }
                    }
                    Err(DataApiError::Status(status)) => {
                        warn!("attestation scan aborted: status {:#010x}", status);
                    }
                    Err(err) => {
                        warn!("attestation transport failure: {}", err);
                        anyhow::bail!(err);
                    }
                }
            }
            read = control.read(&mut control_byte) => {
                // The supervisor holds this socket open for the lifetime
                // of the tree; readable means it is gone.
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if SignalState::from_byte(signal_byte[0])
                            == Some(SignalState::Terminate)
                        {
                            info!("terminate signal; attestation service exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
