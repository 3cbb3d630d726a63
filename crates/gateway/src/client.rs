//! Provider contract.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, TransactionId};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A charge to dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Our transaction id, sent so the provider can deduplicate re-dispatches.
    pub reference: TransactionId,
    pub amount: Money,
}

/// Provider answer to a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    /// Accepted and settled.
    Approved { provider_reference: String },
    /// Accepted; settlement still has to be confirmed.
    Pending { provider_reference: String },
    /// Explicitly declined.
    Declined { code: String },
}

/// Settlement state of an accepted charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Settled,
    Pending,
    Rejected { code: String },
}

/// A refund of a settled charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub reference: TransactionId,
    pub provider_reference: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_reference: String,
}

/// Payment provider operations, treated as opaque RPCs.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Identifies the provider endpoint; circuit breakers are keyed by it.
    fn endpoint(&self) -> &str;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;

    async fn settlement_status(&self, provider_reference: &str) -> Result<SettlementStatus>;

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt>;
}

#[async_trait]
impl<G: PaymentGateway + ?Sized> PaymentGateway for Arc<G> {
    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        (**self).charge(request).await
    }

    async fn settlement_status(&self, provider_reference: &str) -> Result<SettlementStatus> {
        (**self).settlement_status(provider_reference).await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        (**self).refund(request).await
    }
}
