use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::conditional::update_order;
use crate::error::DispatchError;
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::store::OrderStore;

pub const CODE_LENGTH: usize = 6;

/// Uppercase letters and digits without the look-alikes 0/O and 1/I.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub verified_at: DateTime<Utc>,
}

/// Issues the per-order delivery code and checks it at the door.
///
/// The protocol keeps nothing between calls. A code stays bound to its order
/// through the store, which refuses an order whose code was ever issued
/// before. No lockout is applied to repeated mismatches; rate limiting sits in front
/// of this service.
pub struct ConfirmationProtocol {
    store: Arc<dyn OrderStore>,
    metrics: Metrics,
}

impl ConfirmationProtocol {
    pub fn new(store: Arc<dyn OrderStore>, metrics: Metrics) -> Self {
        Self {
            store,
            metrics,
        }
    }

    /// A candidate code for a new order. It becomes the order's code once
    /// the store accepts the insert; on a collision the caller draws again.
    pub fn generate(&self) -> String {
        random_code()
    }

    /// Checks `supplied` against the order's code. On success the code is
    /// consumed and the order is marked as confirmed, which unlocks the
    /// `delivered` transition.
    pub async fn verify(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        supplied: &str,
    ) -> Result<Verification, DispatchError> {
        let verified_at = Utc::now();
        let result = update_order(
            self.store.as_ref(),
            order_id,
            |order| plan_verification(order, driver_id, supplied, verified_at).map(Some),
            || DispatchError::ConcurrentUpdate(order_id),
        )
        .await;

        match result {
            Ok(_) => {
                self.metrics
                    .confirmation_attempts_total
                    .with_label_values(&["verified"])
                    .inc();
                info!(order_id = %order_id, driver_id = %driver_id, "delivery code verified");
                Ok(Verification {
                    order_id,
                    driver_id,
                    verified_at,
                })
            }
            Err(err) => {
                let outcome = match err {
                    DispatchError::CodeMismatch(_) => "mismatch",
                    DispatchError::DriverNotAssigned { .. } => "unauthorized",
                    _ => "error",
                };
                self.metrics
                    .confirmation_attempts_total
                    .with_label_values(&[outcome])
                    .inc();
                warn!(order_id = %order_id, driver_id = %driver_id, error = %err, "delivery code rejected");
                Err(err)
            }
        }
    }
}

fn plan_verification(
    order: &Order,
    driver_id: Uuid,
    supplied: &str,
    verified_at: DateTime<Utc>,
) -> Result<Order, DispatchError> {
    if order.status.is_terminal() {
        return Err(DispatchError::TerminalState {
            order_id: order.id,
            status: order.status,
        });
    }

    if !order.is_assigned_to(driver_id) {
        return Err(DispatchError::DriverNotAssigned {
            order_id: order.id,
            driver_id,
        });
    }

    let matches = order
        .confirmation_code
        .as_deref()
        .is_some_and(|expected| codes_match(expected, supplied));
    if !matches {
        return Err(DispatchError::CodeMismatch(order.id));
    }

    let mut updated = order.clone();
    updated.confirmation_code = None;
    updated.confirmation_verified_at = Some(verified_at);
    updated.updated_at = verified_at;
    Ok(updated)
}

/// Case-insensitive, ignoring surrounding whitespace.
pub fn codes_match(expected: &str, supplied: &str) -> bool {
    let supplied = supplied.trim();
    supplied.len() == expected.len() && supplied.eq_ignore_ascii_case(expected)
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::{codes_match, ConfirmationProtocol, ALPHABET, CODE_LENGTH};
    use crate::observability::metrics::Metrics;
    use crate::store::MemoryStore;

    fn protocol() -> ConfirmationProtocol {
        ConfirmationProtocol::new(Arc::new(MemoryStore::new()), Metrics::new())
    }

    #[test]
    fn generated_codes_use_the_code_alphabet() {
        let code = protocol().generate();

        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)), "{code}");
    }

    #[test]
    fn draws_spread_over_the_code_space() {
        let protocol = protocol();
        let codes: HashSet<String> = (0..500).map(|_| protocol.generate()).collect();
        assert!(codes.len() > 490, "{} distinct of 500", codes.len());
    }

    #[test]
    fn comparison_ignores_case_and_padding() {
        assert!(codes_match("AB3CD9", "ab3cd9"));
        assert!(codes_match("AB3CD9", " AB3cd9 "));
        assert!(!codes_match("AB3CD9", "AB3CD"));
        assert!(!codes_match("AB3CD9", "WRONG1"));
    }
}
