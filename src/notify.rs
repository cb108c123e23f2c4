//! Stand-in for the external transactional-email provider.
//!
//! Real delivery is out of scope; the contract is fire-and-forget, so the
//! checkout path only hands the payload over and never waits on, or fails
//! because of, the sender.

use rust_decimal::Decimal;
use uuid::Uuid;

pub fn send_order_confirmation(email: &str, order_id: Uuid, total: Decimal) {
    tracing::info!(%order_id, email, %total, "order confirmation queued");
}

pub fn send_status_update(email: &str, order_id: Uuid, status: &str) {
    tracing::info!(%order_id, email, status, "status update queued");
}
