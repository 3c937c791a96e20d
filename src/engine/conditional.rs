use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::order::Order;
use crate::store::{Expected, OrderStore, StoreError, WriteOutcome};

/// One read plus at most one fresh re-read.
const MAX_ATTEMPTS: usize = 2;

/// Result of a planned mutation. `after == before` when the plan decided no
/// write was needed.
#[derive(Debug, Clone)]
pub struct Transition {
    pub before: Order,
    pub after: Order,
    pub applied: bool,
}

/// Reads the order, asks `plan` for the replacement and writes it back
/// conditionally on the snapshot it was planned against.
///
/// A conflict or a transient store failure triggers one retry from a fresh
/// read, so the plan gets to re-judge the newer state (a lost race usually
/// surfaces as the plan's own error). A second conflict yields `lost_race()`.
/// A second transient failure surfaces as `StoreUnavailable`.
pub async fn update_order<P, L>(
    store: &dyn OrderStore,
    order_id: Uuid,
    mut plan: P,
    lost_race: L,
) -> Result<Transition, DispatchError>
where
    P: FnMut(&Order) -> Result<Option<Order>, DispatchError> + Send,
    L: FnOnce() -> DispatchError + Send,
{
    let mut last_failure = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let current = match store.get_order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => return Err(DispatchError::OrderNotFound(order_id)),
            Err(StoreError::Unavailable(msg)) => {
                debug!(order_id = %order_id, attempt, error = %msg, "order read failed");
                last_failure = Some(StoreError::Unavailable(msg));
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let Some(updated) = plan(&current)? else {
            return Ok(Transition {
                after: current.clone(),
                before: current,
                applied: false,
            });
        };

        match store.update_order_if(Expected::of(&current), updated).await {
            Ok(WriteOutcome::Applied(stored)) => {
                return Ok(Transition {
                    before: current,
                    after: stored,
                    applied: true,
                });
            }
            Ok(WriteOutcome::Conflict) => {
                debug!(order_id = %order_id, attempt, "conditional write lost to a concurrent update");
                last_failure = None;
            }
            Err(StoreError::Unavailable(msg)) => {
                debug!(order_id = %order_id, attempt, error = %msg, "conditional write failed");
                last_failure = Some(StoreError::Unavailable(msg));
            }
            Err(err) => return Err(err.into()),
        }
    }

    match last_failure {
        Some(err) => Err(err.into()),
        None => Err(lost_race()),
    }
}
