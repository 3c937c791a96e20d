use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::conditional::{update_order, Transition};
use crate::engine::confirmation::{ConfirmationProtocol, Verification};
use crate::engine::fanout::{EventFanout, OrderTurn};
use crate::engine::tracking::TrackingCodeGenerator;
use crate::error::DispatchError;
use crate::models::driver::{DriverProfile, NewDriver};
use crate::models::event::{OrderEvent, StatusChange};
use crate::models::order::{NewOrder, Order, OrderStatus, PaymentMethod, PaymentStatus};
use crate::observability::metrics::Metrics;
use crate::store::{OrderStore, StoreError};

const CREATE_ATTEMPTS: usize = 5;

/// Owns the order state machine. Holds no order state itself: every mutation
/// is a conditional write against the store, so concurrent callers on the
/// same order never both succeed from the same snapshot.
///
/// Mutations that announce a status change hold the order's [`OrderTurn`]
/// from the conditional write until the event is published, so subscribers
/// and the status history see changes in commit order.
pub struct OrderCoordinator {
    store: Arc<dyn OrderStore>,
    fanout: EventFanout,
    confirmation: ConfirmationProtocol,
    tracking: TrackingCodeGenerator,
    metrics: Metrics,
}

impl OrderCoordinator {
    pub fn new(store: Arc<dyn OrderStore>, fanout: EventFanout, metrics: Metrics) -> Self {
        Self {
            confirmation: ConfirmationProtocol::new(store.clone(), metrics.clone()),
            tracking: TrackingCodeGenerator::new(),
            store,
            fanout,
            metrics,
        }
    }

    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order, DispatchError> {
        validate_new_order(&new_order)?;

        let order_id = Uuid::new_v4();
        let mut turn = self.fanout.begin(order_id).await;

        let mut attempt = 0;
        let order = loop {
            attempt += 1;
            let now = Utc::now();
            let candidate = Order {
                id: order_id,
                tracking_code: self.tracking.generate(now),
                sender_id: new_order.sender_id,
                receiver_name: new_order.receiver_name.trim().to_string(),
                receiver_phone: new_order.receiver_phone.trim().to_string(),
                driver_id: None,
                pickup_address: new_order.pickup_address.trim().to_string(),
                delivery_address: new_order.delivery_address.trim().to_string(),
                delivery_amount: new_order.delivery_amount,
                payment_status: PaymentStatus::Unpaid,
                payment_method: None,
                payment_reference: None,
                status: OrderStatus::Pending,
                confirmation_code: Some(self.confirmation.generate()),
                confirmation_verified_at: None,
                created_at: now,
                updated_at: now,
                revision: 0,
            };

            match self.store.insert_order(candidate).await {
                Ok(order) => break order,
                Err(StoreError::DuplicateTrackingCode(code)) if attempt < CREATE_ATTEMPTS => {
                    debug!(tracking_code = %code, attempt, "tracking code collision; regenerating");
                }
                Err(StoreError::DuplicateConfirmationCode) if attempt < CREATE_ATTEMPTS => {
                    debug!(order_id = %order_id, attempt, "confirmation code collision; regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        };

        info!(
            order_id = %order.id,
            tracking_code = %order.tracking_code,
            sender_id = %order.sender_id,
            "order created"
        );
        self.emit(&mut turn, None, &order, order.sender_id, order.created_at)
            .await;

        Ok(order)
    }

    /// Claims a pending order for `driver_id`. Exactly one of any number of
    /// concurrent callers wins; the rest get `OrderAlreadyAssigned`.
    pub async fn accept_order(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Order, DispatchError> {
        let result = self.try_accept(order_id, driver_id).await;

        let outcome = match &result {
            Ok(_) => "won",
            Err(DispatchError::OrderAlreadyAssigned(_)) => "lost",
            Err(_) => "rejected",
        };
        self.metrics
            .accept_attempts_total
            .with_label_values(&[outcome])
            .inc();

        result
    }

    async fn try_accept(&self, order_id: Uuid, driver_id: Uuid) -> Result<Order, DispatchError> {
        let mut turn = self.fanout.begin(order_id).await;
        let current = self.get_order(order_id).await?;
        plan_acceptance(&current, driver_id)?;

        if self.store.get_driver(driver_id).await?.is_none() {
            return Err(DispatchError::DriverNotFound(driver_id));
        }
        if !self.store.set_availability_if(driver_id, true, false).await? {
            return Err(DispatchError::DriverUnavailable(driver_id));
        }

        let now = Utc::now();
        let result = update_order(
            self.store.as_ref(),
            order_id,
            |order| {
                plan_acceptance(order, driver_id)?;
                let mut updated = order.clone();
                updated.status = OrderStatus::Accepted;
                updated.driver_id = Some(driver_id);
                updated.updated_at = now;
                Ok(Some(updated))
            },
            || DispatchError::OrderAlreadyAssigned(order_id),
        )
        .await;

        match result {
            Ok(transition) => {
                info!(order_id = %order_id, driver_id = %driver_id, "order accepted");
                self.keep_driver_busy(driver_id).await;
                self.emit(&mut turn, Some(&transition.before), &transition.after, driver_id, now)
                    .await;
                Ok(transition.after)
            }
            Err(err) => {
                debug!(order_id = %order_id, driver_id = %driver_id, error = %err, "accept attempt failed");
                self.release_driver(driver_id).await;
                Err(err)
            }
        }
    }

    /// Moves the order one step along its lifecycle, or cancels it.
    /// `actor_id` must be the assigned driver; the sender may also cancel.
    pub async fn advance_status(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
        next: OrderStatus,
    ) -> Result<Order, DispatchError> {
        if next == OrderStatus::Accepted {
            let current = self.get_order(order_id).await?;
            if current.status == OrderStatus::Pending {
                return self.accept_order(order_id, actor_id).await;
            }
        }

        let mut turn = self.fanout.begin(order_id).await;
        let now = Utc::now();
        let transition = update_order(
            self.store.as_ref(),
            order_id,
            |order| plan_advance(order, actor_id, next, now).map(Some),
            || DispatchError::ConcurrentUpdate(order_id),
        )
        .await
        .inspect_err(|err| {
            warn!(order_id = %order_id, actor_id = %actor_id, to = %next, error = %err, "status change rejected");
        })?;

        let Transition { before, after, .. } = transition;
        info!(
            order_id = %order_id,
            actor_id = %actor_id,
            from = %before.status,
            to = %after.status,
            "order status changed"
        );

        if let Some(driver_id) = after.driver_id {
            match after.status {
                OrderStatus::Delivered => {
                    if let Err(err) = self.store.record_completed_delivery(driver_id).await {
                        error!(driver_id = %driver_id, error = %err, "failed to record completed delivery");
                    }
                }
                OrderStatus::Cancelled => self.release_driver(driver_id).await,
                _ => {}
            }
        }

        self.emit(&mut turn, Some(&before), &after, actor_id, now)
            .await;
        Ok(after)
    }

    /// Checks the delivery code presented by the assigned driver.
    pub async fn verify_delivery_code(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        code: &str,
    ) -> Result<Verification, DispatchError> {
        self.confirmation.verify(order_id, driver_id, code).await
    }

    /// Marks the order paid once the payment processor reports success.
    /// Repeating the same reference is a no-op.
    pub async fn record_payment(
        &self,
        order_id: Uuid,
        method: PaymentMethod,
        reference: &str,
    ) -> Result<Order, DispatchError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(DispatchError::Validation(
                "payment reference cannot be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let transition = update_order(
            self.store.as_ref(),
            order_id,
            |order| plan_payment(order, method, reference, now),
            || DispatchError::ConcurrentUpdate(order_id),
        )
        .await?;

        if transition.applied {
            info!(order_id = %order_id, method = ?method, reference = %reference, "payment recorded");
        } else {
            debug!(order_id = %order_id, reference = %reference, "payment already recorded");
        }

        Ok(transition.after)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, DispatchError> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(DispatchError::OrderNotFound(order_id))
    }

    pub async fn find_by_tracking_code(&self, code: &str) -> Result<Option<Order>, DispatchError> {
        Ok(self.store.find_by_tracking_code(code.trim()).await?)
    }

    pub async fn orders_for_sender(&self, sender_id: Uuid) -> Result<Vec<Order>, DispatchError> {
        Ok(self.store.orders_for_sender(sender_id).await?)
    }

    pub async fn status_history(&self, order_id: Uuid) -> Result<Vec<StatusChange>, DispatchError> {
        self.get_order(order_id).await?;
        Ok(self.store.status_history(order_id).await?)
    }

    pub async fn register_driver(&self, new_driver: NewDriver) -> Result<DriverProfile, DispatchError> {
        if !new_driver.rating.is_finite() {
            return Err(DispatchError::Validation("rating must be a number".to_string()));
        }

        let driver = DriverProfile {
            id: new_driver.id.unwrap_or_else(Uuid::new_v4),
            is_available: true,
            rating: new_driver.rating.clamp(0.0, 5.0),
            total_deliveries: new_driver.total_deliveries,
            vehicle_type: new_driver.vehicle_type,
            updated_at: Utc::now(),
        };

        let driver = self.store.insert_driver(driver).await.map_err(|err| match err {
            StoreError::DuplicateDriver(id) => {
                DispatchError::Validation(format!("driver {id} is already registered"))
            }
            other => other.into(),
        })?;

        info!(driver_id = %driver.id, vehicle_type = ?driver.vehicle_type, "driver registered");
        Ok(driver)
    }

    pub async fn list_drivers(&self) -> Result<Vec<DriverProfile>, DispatchError> {
        Ok(self.store.list_drivers().await?)
    }

    /// The driver's own on/off toggle. Going available is refused while the
    /// driver still holds an unfinished order.
    pub async fn set_driver_availability(
        &self,
        driver_id: Uuid,
        available: bool,
    ) -> Result<DriverProfile, DispatchError> {
        let driver = self
            .store
            .get_driver(driver_id)
            .await?
            .ok_or(DispatchError::DriverNotFound(driver_id))?;

        if driver.is_available != available {
            if available && self.holds_unfinished_order(driver_id).await? {
                return Err(busy_driver(driver_id));
            }

            if !self
                .store
                .set_availability_if(driver_id, !available, available)
                .await?
            {
                debug!(driver_id = %driver_id, available, "availability changed concurrently");
            } else if available && self.holds_unfinished_order(driver_id).await? {
                // An accept committed between the check and the flip.
                self.keep_driver_busy(driver_id).await;
                return Err(busy_driver(driver_id));
            }
            info!(driver_id = %driver_id, available, "driver availability changed");
        }

        self.store
            .get_driver(driver_id)
            .await?
            .ok_or(DispatchError::DriverNotFound(driver_id))
    }

    async fn holds_unfinished_order(&self, driver_id: Uuid) -> Result<bool, DispatchError> {
        Ok(self
            .store
            .orders_for_driver(driver_id)
            .await?
            .iter()
            .any(|order| !order.status.is_terminal()))
    }

    /// Takes the driver off the market again if they toggled themselves
    /// available while an accept was in flight.
    async fn keep_driver_busy(&self, driver_id: Uuid) {
        match self.store.set_availability_if(driver_id, true, false).await {
            Ok(true) => {
                warn!(driver_id = %driver_id, "driver went available mid-accept; marked busy again");
            }
            Ok(false) => {}
            Err(err) => error!(driver_id = %driver_id, error = %err, "failed to mark driver busy"),
        }
    }

    async fn release_driver(&self, driver_id: Uuid) {
        if let Err(err) = self.store.set_availability_if(driver_id, false, true).await {
            error!(driver_id = %driver_id, error = %err, "failed to release driver");
        }
    }

    async fn emit(
        &self,
        turn: &mut OrderTurn,
        before: Option<&Order>,
        after: &Order,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) {
        self.metrics
            .status_transitions_total
            .with_label_values(&[after.status.as_str()])
            .inc();

        let change = StatusChange {
            order_id: after.id,
            from: before.map(|order| order.status),
            to: after.status,
            actor_id,
            driver_id: after.driver_id,
            sequence: turn.next_sequence(),
            changed_at: at,
        };

        if let Err(err) = self.store.append_status_change(change.clone()).await {
            error!(order_id = %after.id, error = %err, "failed to append status history");
        }

        turn.publish(OrderEvent::StatusChanged(change));
    }
}

fn busy_driver(driver_id: Uuid) -> DispatchError {
    DispatchError::Validation(format!("driver {driver_id} has an unfinished delivery"))
}

fn validate_new_order(new_order: &NewOrder) -> Result<(), DispatchError> {
    let required = [
        ("receiver_name", &new_order.receiver_name),
        ("receiver_phone", &new_order.receiver_phone),
        ("pickup_address", &new_order.pickup_address),
        ("delivery_address", &new_order.delivery_address),
    ];

    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(DispatchError::Validation(format!("{field} cannot be empty")));
        }
    }

    if new_order.delivery_amount < 0 {
        return Err(DispatchError::Validation(
            "delivery_amount cannot be negative".to_string(),
        ));
    }

    Ok(())
}

fn plan_acceptance(order: &Order, driver_id: Uuid) -> Result<(), DispatchError> {
    if order.status.is_terminal() {
        return Err(DispatchError::TerminalState {
            order_id: order.id,
            status: order.status,
        });
    }

    if order.status != OrderStatus::Pending || order.driver_id.is_some() {
        debug!(order_id = %order.id, driver_id = %driver_id, "order already taken");
        return Err(DispatchError::OrderAlreadyAssigned(order.id));
    }

    Ok(())
}

fn plan_advance(
    order: &Order,
    actor_id: Uuid,
    next: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Order, DispatchError> {
    if order.status.is_terminal() {
        return Err(DispatchError::TerminalState {
            order_id: order.id,
            status: order.status,
        });
    }

    if !order.status.can_transition_to(next) {
        return Err(DispatchError::InvalidTransition {
            from: order.status,
            to: next,
        });
    }

    let authorized = match next {
        OrderStatus::Cancelled => actor_id == order.sender_id || order.is_assigned_to(actor_id),
        _ => order.is_assigned_to(actor_id),
    };
    if !authorized {
        return Err(DispatchError::NotAssignedDriver {
            order_id: order.id,
            actor_id,
        });
    }

    if next == OrderStatus::Delivered && !order.is_confirmed() {
        return Err(DispatchError::ConfirmationRequired(order.id));
    }

    let mut updated = order.clone();
    updated.status = next;
    updated.updated_at = now;
    if next.is_terminal() {
        updated.confirmation_code = None;
    }
    Ok(updated)
}

fn plan_payment(
    order: &Order,
    method: PaymentMethod,
    reference: &str,
    now: DateTime<Utc>,
) -> Result<Option<Order>, DispatchError> {
    if order.status == OrderStatus::Cancelled {
        return Err(DispatchError::OrderCancelled(order.id));
    }

    if order.payment_status == PaymentStatus::Paid {
        return match order.payment_reference.as_deref() {
            Some(existing) if existing == reference => Ok(None),
            existing => Err(DispatchError::PaymentAlreadyRecorded {
                order_id: order.id,
                reference: existing.unwrap_or_default().to_string(),
            }),
        };
    }

    let mut updated = order.clone();
    updated.payment_status = PaymentStatus::Paid;
    updated.payment_method = Some(method);
    updated.payment_reference = Some(reference.to_string());
    updated.updated_at = now;
    Ok(Some(updated))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{plan_acceptance, plan_advance, plan_payment, validate_new_order};
    use crate::error::DispatchError;
    use crate::models::order::{NewOrder, Order, OrderStatus, PaymentMethod, PaymentStatus};

    fn order(status: OrderStatus, driver_id: Option<Uuid>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            tracking_code: "FKS-UNIT".to_string(),
            sender_id: Uuid::from_u128(1),
            receiver_name: "Akinyi".to_string(),
            receiver_phone: "+254711111111".to_string(),
            driver_id,
            pickup_address: "Tom Mboya Street".to_string(),
            delivery_address: "Kilimani".to_string(),
            delivery_amount: 500,
            payment_status: PaymentStatus::Unpaid,
            payment_method: None,
            payment_reference: None,
            status,
            confirmation_code: Some("ZX9KQ2".to_string()),
            confirmation_verified_at: None,
            created_at: now,
            updated_at: now,
            revision: 3,
        }
    }

    fn new_order() -> NewOrder {
        NewOrder {
            sender_id: Uuid::new_v4(),
            receiver_name: "Akinyi".to_string(),
            receiver_phone: "+254711111111".to_string(),
            pickup_address: "Tom Mboya Street".to_string(),
            delivery_address: "Kilimani".to_string(),
            delivery_amount: 500,
        }
    }

    #[test]
    fn blank_fields_and_negative_amounts_are_rejected() {
        assert!(validate_new_order(&new_order()).is_ok());

        let mut blank = new_order();
        blank.receiver_phone = "   ".to_string();
        assert!(matches!(
            validate_new_order(&blank),
            Err(DispatchError::Validation(msg)) if msg.contains("receiver_phone")
        ));

        let mut negative = new_order();
        negative.delivery_amount = -1;
        assert!(matches!(validate_new_order(&negative), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn accepting_an_accepted_order_is_a_lost_race() {
        let taken = order(OrderStatus::Accepted, Some(Uuid::from_u128(7)));
        assert!(matches!(
            plan_acceptance(&taken, Uuid::from_u128(8)),
            Err(DispatchError::OrderAlreadyAssigned(_))
        ));
    }

    #[test]
    fn accepting_a_cancelled_order_hits_the_terminal_state() {
        let cancelled = order(OrderStatus::Cancelled, None);
        assert!(matches!(
            plan_acceptance(&cancelled, Uuid::from_u128(8)),
            Err(DispatchError::TerminalState { status: OrderStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn only_the_assigned_driver_moves_the_order() {
        let driver = Uuid::from_u128(7);
        let accepted = order(OrderStatus::Accepted, Some(driver));

        let err = plan_advance(&accepted, Uuid::from_u128(9), OrderStatus::PickedUp, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAssignedDriver { .. }));

        let picked = plan_advance(&accepted, driver, OrderStatus::PickedUp, Utc::now()).unwrap();
        assert_eq!(picked.status, OrderStatus::PickedUp);
    }

    #[test]
    fn sender_may_cancel_but_not_advance() {
        let sender = Uuid::from_u128(1);
        let accepted = order(OrderStatus::Accepted, Some(Uuid::from_u128(7)));

        assert!(matches!(
            plan_advance(&accepted, sender, OrderStatus::PickedUp, Utc::now()),
            Err(DispatchError::NotAssignedDriver { .. })
        ));
        let cancelled = plan_advance(&accepted, sender, OrderStatus::Cancelled, Utc::now()).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.driver_id, Some(Uuid::from_u128(7)));
    }

    #[test]
    fn skipping_steps_is_an_invalid_transition() {
        let pending = order(OrderStatus::Pending, None);
        assert!(matches!(
            plan_advance(&pending, Uuid::from_u128(1), OrderStatus::PickedUp, Utc::now()),
            Err(DispatchError::InvalidTransition {
                from: OrderStatus::Pending,
                to: OrderStatus::PickedUp
            })
        ));
    }

    #[test]
    fn delivery_needs_a_verified_code() {
        let driver = Uuid::from_u128(7);
        let mut out = order(OrderStatus::OutForDelivery, Some(driver));
        assert!(matches!(
            plan_advance(&out, driver, OrderStatus::Delivered, Utc::now()),
            Err(DispatchError::ConfirmationRequired(_))
        ));

        out.confirmation_code = None;
        out.confirmation_verified_at = Some(Utc::now());
        let delivered = plan_advance(&out, driver, OrderStatus::Delivered, Utc::now()).unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);
    }

    #[test]
    fn repeated_payment_reference_is_a_no_op() {
        let mut paid = order(OrderStatus::Accepted, Some(Uuid::from_u128(7)));
        paid.payment_status = PaymentStatus::Paid;
        paid.payment_method = Some(PaymentMethod::Mpesa);
        paid.payment_reference = Some("FKS-1700000000000".to_string());

        let same = plan_payment(&paid, PaymentMethod::Mpesa, "FKS-1700000000000", Utc::now());
        assert!(matches!(same, Ok(None)));

        let other = plan_payment(&paid, PaymentMethod::Card, "FKS-1", Utc::now());
        assert!(matches!(other, Err(DispatchError::PaymentAlreadyRecorded { .. })));
    }

    #[test]
    fn cancelled_orders_cannot_be_paid() {
        let cancelled = order(OrderStatus::Cancelled, None);
        assert!(matches!(
            plan_payment(&cancelled, PaymentMethod::Cash, "REF", Utc::now()),
            Err(DispatchError::OrderCancelled(_))
        ));
    }
}
