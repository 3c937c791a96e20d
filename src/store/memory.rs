use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::chat::ChatMessage;
use crate::models::driver::DriverProfile;
use crate::models::event::StatusChange;
use crate::models::order::Order;
use crate::store::{Expected, OrderStore, StoreError, WriteOutcome};

/// In-process store: an arena of orders keyed by id plus indexes of every
/// tracking and confirmation code ever issued. Conditional writes hold the
/// order's shard lock only for the compare and swap itself.
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    tracking_index: DashMap<String, Uuid>,
    confirmation_index: DashMap<String, Uuid>,
    drivers: DashMap<Uuid, DriverProfile>,
    messages: DashMap<Uuid, Vec<ChatMessage>>,
    history: DashMap<Uuid, Vec<StatusChange>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: Order) -> Result<Order, StoreError> {
        match self.tracking_index.entry(order.tracking_code.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::DuplicateTrackingCode(order.tracking_code));
            }
            Entry::Vacant(slot) => {
                slot.insert(order.id);
            }
        }

        if let Some(code) = order.confirmation_code.as_deref() {
            match self.confirmation_index.entry(code.to_ascii_uppercase()) {
                Entry::Occupied(_) => {
                    self.tracking_index.remove(&order.tracking_code);
                    return Err(StoreError::DuplicateConfirmationCode);
                }
                Entry::Vacant(slot) => {
                    slot.insert(order.id);
                }
            }
        }

        match self.orders.entry(order.id) {
            Entry::Occupied(_) => {
                self.tracking_index.remove(&order.tracking_code);
                if let Some(code) = order.confirmation_code.as_deref() {
                    self.confirmation_index.remove(&code.to_ascii_uppercase());
                }
                Err(StoreError::DuplicateOrder(order.id))
            }
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(order)
            }
        }
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn find_by_tracking_code(&self, code: &str) -> Result<Option<Order>, StoreError> {
        let Some(order_id) = self.tracking_index.get(code).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.get_order(order_id).await
    }

    async fn orders_for_sender(&self, sender_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.value().sender_id == sender_id)
            .map(|entry| entry.value().clone())
            .collect();

        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn orders_for_driver(&self, driver_id: Uuid) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .filter(|entry| entry.value().driver_id == Some(driver_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_order_if(
        &self,
        expected: Expected,
        mut updated: Order,
    ) -> Result<WriteOutcome, StoreError> {
        let mut current = self
            .orders
            .get_mut(&updated.id)
            .ok_or(StoreError::OrderNotFound(updated.id))?;

        if !expected.matches(&current) {
            return Ok(WriteOutcome::Conflict);
        }

        updated.revision = current.revision + 1;
        *current = updated.clone();
        Ok(WriteOutcome::Applied(updated))
    }

    async fn insert_driver(&self, driver: DriverProfile) -> Result<DriverProfile, StoreError> {
        match self.drivers.entry(driver.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateDriver(driver.id)),
            Entry::Vacant(slot) => {
                slot.insert(driver.clone());
                Ok(driver)
            }
        }
    }

    async fn get_driver(&self, driver_id: Uuid) -> Result<Option<DriverProfile>, StoreError> {
        Ok(self.drivers.get(&driver_id).map(|entry| entry.value().clone()))
    }

    async fn list_drivers(&self) -> Result<Vec<DriverProfile>, StoreError> {
        Ok(self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn set_availability_if(
        &self,
        driver_id: Uuid,
        expected: bool,
        available: bool,
    ) -> Result<bool, StoreError> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or(StoreError::DriverNotFound(driver_id))?;

        if driver.is_available != expected {
            return Ok(false);
        }

        driver.is_available = available;
        driver.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_completed_delivery(
        &self,
        driver_id: Uuid,
    ) -> Result<DriverProfile, StoreError> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or(StoreError::DriverNotFound(driver_id))?;

        driver.total_deliveries = driver.total_deliveries.saturating_add(1);
        driver.is_available = true;
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }

    async fn append_message(&self, message: ChatMessage) -> Result<(), StoreError> {
        self.messages
            .entry(message.order_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages = self
            .messages
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        messages.sort_by_key(|message| message.sequence);
        Ok(messages)
    }

    async fn append_status_change(&self, change: StatusChange) -> Result<(), StoreError> {
        self.history.entry(change.order_id).or_default().push(change);
        Ok(())
    }

    async fn status_history(&self, order_id: Uuid) -> Result<Vec<StatusChange>, StoreError> {
        let mut history = self
            .history
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        history.sort_by_key(|change| change.sequence);
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::models::order::{Order, OrderStatus, PaymentStatus};
    use crate::store::{Expected, OrderStore, StoreError, WriteOutcome};

    fn order(tracking_code: &str) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            tracking_code: tracking_code.to_string(),
            sender_id: Uuid::new_v4(),
            receiver_name: "Wanjiru".to_string(),
            receiver_phone: "+254712345678".to_string(),
            driver_id: None,
            pickup_address: "Moi Avenue".to_string(),
            delivery_address: "Ngong Road".to_string(),
            delivery_amount: 500,
            payment_status: PaymentStatus::Unpaid,
            payment_method: None,
            payment_reference: None,
            status: OrderStatus::Pending,
            confirmation_code: Some("ABC234".to_string()),
            confirmation_verified_at: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_tracking_code_is_rejected() {
        let store = MemoryStore::new();
        store.insert_order(order("FKS-1")).await.unwrap();

        let err = store.insert_order(order("FKS-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTrackingCode(code) if code == "FKS-1"));
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn confirmation_codes_are_never_reissued() {
        let store = MemoryStore::new();
        let first = store.insert_order(order("FKS-4")).await.unwrap();

        let mut consumed = first.clone();
        consumed.confirmation_code = None;
        store
            .update_order_if(Expected::of(&first), consumed)
            .await
            .unwrap();

        let mut reuse = order("FKS-5");
        reuse.confirmation_code = Some("abc234".to_string());
        let err = store.insert_order(reuse).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateConfirmationCode));

        let mut fresh = order("FKS-5");
        fresh.confirmation_code = Some("XYZ789".to_string());
        store.insert_order(fresh).await.unwrap();
        assert_eq!(store.order_count(), 2);
    }

    #[tokio::test]
    async fn stale_snapshot_loses_the_conditional_write() {
        let store = MemoryStore::new();
        let original = store.insert_order(order("FKS-2")).await.unwrap();
        let snapshot = Expected::of(&original);

        let mut first = original.clone();
        first.status = OrderStatus::Cancelled;
        let applied = store.update_order_if(snapshot, first).await.unwrap();
        let WriteOutcome::Applied(stored) = applied else {
            panic!("first write should land");
        };
        assert_eq!(stored.revision, 1);

        let mut second = original.clone();
        second.status = OrderStatus::Accepted;
        second.driver_id = Some(Uuid::new_v4());
        let outcome = store.update_order_if(snapshot, second).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);

        let current = store.get_order(original.id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn lookup_by_tracking_code() {
        let store = MemoryStore::new();
        let inserted = store.insert_order(order("FKS-3")).await.unwrap();

        let found = store.find_by_tracking_code("FKS-3").await.unwrap();
        assert_eq!(found.map(|o| o.id), Some(inserted.id));
        assert!(store.find_by_tracking_code("FKS-404").await.unwrap().is_none());
    }
}
