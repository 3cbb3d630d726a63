//! Downstream consumers of payment events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use domain::TransactionStatus;
use event_bus::{EventEnvelope, EventHandler, HandlerError};
use serde::Serialize;

/// Booking state as seen by the booking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// Confirms bookings whose payment was captured and cancels them once the
/// payment is refunded.
///
/// The booking id comes from the business payload the caller attached to
/// the payment. Run it behind an
/// [`event_bus::DeduplicatingConsumer`] so redelivered events are ignored.
#[derive(Clone, Default)]
pub struct BookingConfirmations {
    bookings: Arc<Mutex<HashMap<String, BookingStatus>>>,
}

impl BookingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, booking_id: &str) -> Option<BookingStatus> {
        self.bookings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(booking_id)
            .copied()
    }

    fn set(&self, booking_id: &str, status: BookingStatus) {
        self.bookings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(booking_id.to_string(), status);
    }
}

fn booking_id(event: &EventEnvelope) -> Result<&str, HandlerError> {
    event
        .payload
        .pointer("/business_payload/booking_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            HandlerError::Poison(format!(
                "{} event for transaction {} has no booking_id",
                event.event_type, event.transaction_id
            ))
        })
}

#[async_trait]
impl EventHandler for BookingConfirmations {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let status = if event.status == TransactionStatus::Captured.as_str() {
            BookingStatus::Confirmed
        } else if event.status == TransactionStatus::Refunded.as_str() {
            BookingStatus::Cancelled
        } else {
            return Ok(());
        };

        let booking_id = booking_id(event)?;
        self.set(booking_id, status);
        tracing::info!(
            booking_id,
            transaction_id = %event.transaction_id,
            status = ?status,
            "booking updated"
        );
        Ok(())
    }
}
