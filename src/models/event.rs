use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::chat::ChatMessage;
use crate::models::order::OrderStatus;

/// One entry in an order's status history. `from` is empty for the
/// creation entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub order_id: Uuid,
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub actor_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub sequence: u64,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    StatusChanged(StatusChange),
    ChatMessage(ChatMessage),
}

impl OrderEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            OrderEvent::StatusChanged(change) => change.sequence,
            OrderEvent::ChatMessage(message) => message.sequence,
        }
    }
}
