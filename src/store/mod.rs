//! Durable-store boundary.
//!
//! Every order mutation goes through [`OrderStore::update_order_if`], a single
//! conditional write keyed by the revision, status and driver the caller last
//! observed. Ad hoc read-modify-write on orders is not offered.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::chat::ChatMessage;
use crate::models::driver::DriverProfile;
use crate::models::event::StatusChange;
use crate::models::order::{Order, OrderStatus};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("order {0} already exists")]
    DuplicateOrder(Uuid),

    #[error("driver {0} already exists")]
    DuplicateDriver(Uuid),

    #[error("tracking code {0} already in use")]
    DuplicateTrackingCode(String),

    #[error("confirmation code already issued")]
    DuplicateConfirmationCode,
}

/// The snapshot a conditional write was planned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub revision: u64,
    pub status: OrderStatus,
    pub driver_id: Option<Uuid>,
}

impl Expected {
    pub fn of(order: &Order) -> Self {
        Self {
            revision: order.revision,
            status: order.status,
            driver_id: order.driver_id,
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.revision == order.revision
            && self.status == order.status
            && self.driver_id == order.driver_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write landed; carries the stored record with its new revision.
    Applied(Order),
    /// The record moved on since it was read.
    Conflict,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Rejects an order whose tracking code or confirmation code was ever
    /// issued to another order, including codes already consumed.
    async fn insert_order(&self, order: Order) -> Result<Order, StoreError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_by_tracking_code(&self, code: &str) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    async fn orders_for_sender(&self, sender_id: Uuid) -> Result<Vec<Order>, StoreError>;

    async fn orders_for_driver(&self, driver_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Replaces the order only if it still matches `expected`.
    async fn update_order_if(
        &self,
        expected: Expected,
        updated: Order,
    ) -> Result<WriteOutcome, StoreError>;

    async fn insert_driver(&self, driver: DriverProfile) -> Result<DriverProfile, StoreError>;

    async fn get_driver(&self, driver_id: Uuid) -> Result<Option<DriverProfile>, StoreError>;

    async fn list_drivers(&self) -> Result<Vec<DriverProfile>, StoreError>;

    /// Flips availability only if it currently equals `expected`.
    /// Returns whether the flip happened.
    async fn set_availability_if(
        &self,
        driver_id: Uuid,
        expected: bool,
        available: bool,
    ) -> Result<bool, StoreError>;

    /// Counts a completed delivery and frees the driver.
    async fn record_completed_delivery(
        &self,
        driver_id: Uuid,
    ) -> Result<DriverProfile, StoreError>;

    async fn append_message(&self, message: ChatMessage) -> Result<(), StoreError>;

    /// Ordered by creation sequence.
    async fn messages(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append_status_change(&self, change: StatusChange) -> Result<(), StoreError>;

    async fn status_history(&self, order_id: Uuid) -> Result<Vec<StatusChange>, StoreError>;
}
