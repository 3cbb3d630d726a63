//! Scriptable in-process provider.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::TransactionId;
use uuid::Uuid;

use crate::Result;
use crate::client::{
    ChargeOutcome, ChargeRequest, PaymentGateway, RefundReceipt, RefundRequest, SettlementStatus,
};

#[derive(Default)]
struct SimState {
    charges: VecDeque<Result<ChargeOutcome>>,
    settlements: VecDeque<Result<SettlementStatus>>,
    refunds: VecDeque<Result<RefundReceipt>>,
    charge_calls: u32,
    settlement_calls: u32,
    refund_calls: u32,
    /// Provider-side dedup: a re-dispatched reference gets its first answer.
    accepted: HashMap<TransactionId, String>,
}

/// Provider double.
///
/// Scripted responses are consumed in order per operation; once a queue is
/// empty the provider approves and settles everything. Clones share state.
#[derive(Clone)]
pub struct SimulatedGateway {
    endpoint: String,
    latency: Duration,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            latency: Duration::ZERO,
            state: Arc::default(),
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn script_charge(&self, response: Result<ChargeOutcome>) {
        self.lock().charges.push_back(response);
    }

    pub fn script_settlement(&self, response: Result<SettlementStatus>) {
        self.lock().settlements.push_back(response);
    }

    pub fn script_refund(&self, response: Result<RefundReceipt>) {
        self.lock().refunds.push_back(response);
    }

    pub fn charge_calls(&self) -> u32 {
        self.lock().charge_calls
    }

    pub fn settlement_calls(&self) -> u32 {
        self.lock().settlement_calls
    }

    pub fn refund_calls(&self) -> u32 {
        self.lock().refund_calls
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn reference(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        self.delay().await;
        let mut state = self.lock();
        state.charge_calls += 1;

        if let Some(scripted) = state.charges.pop_front() {
            if let Ok(
                ChargeOutcome::Approved { provider_reference }
                | ChargeOutcome::Pending { provider_reference },
            ) = &scripted
            {
                state
                    .accepted
                    .entry(request.reference)
                    .or_insert_with(|| provider_reference.clone());
            }
            return scripted;
        }

        let provider_reference = state
            .accepted
            .entry(request.reference)
            .or_insert_with(|| reference("SIM"))
            .clone();
        Ok(ChargeOutcome::Approved { provider_reference })
    }

    async fn settlement_status(&self, _provider_reference: &str) -> Result<SettlementStatus> {
        self.delay().await;
        let mut state = self.lock();
        state.settlement_calls += 1;
        state
            .settlements
            .pop_front()
            .unwrap_or(Ok(SettlementStatus::Settled))
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<RefundReceipt> {
        self.delay().await;
        let mut state = self.lock();
        state.refund_calls += 1;
        state.refunds.pop_front().unwrap_or_else(|| {
            Ok(RefundReceipt {
                refund_reference: reference("RF"),
            })
        })
    }
}
