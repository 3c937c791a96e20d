use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::engine::fanout::EventFanout;
use crate::error::DispatchError;
use crate::models::chat::ChatMessage;
use crate::models::event::OrderEvent;
use crate::observability::metrics::Metrics;
use crate::store::OrderStore;

pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Appends chat messages and pushes them over the order's event channel.
/// A message is stored and published within the order's turn, so it shares
/// one sequence with the order's status changes. Messages cannot be edited
/// or deleted.
pub struct ChatRelay {
    store: Arc<dyn OrderStore>,
    fanout: EventFanout,
    metrics: Metrics,
}

impl ChatRelay {
    pub fn new(store: Arc<dyn OrderStore>, fanout: EventFanout, metrics: Metrics) -> Self {
        Self {
            store,
            fanout,
            metrics,
        }
    }

    pub async fn send(
        &self,
        order_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        message: &str,
    ) -> Result<ChatMessage, DispatchError> {
        let text = message.trim();
        if text.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(DispatchError::Validation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        if self.store.get_order(order_id).await?.is_none() {
            return Err(DispatchError::OrderNotFound(order_id));
        }

        let mut turn = self.fanout.begin(order_id).await;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            order_id,
            sender_id,
            receiver_id,
            message: text.to_string(),
            sequence: turn.next_sequence(),
            created_at: Utc::now(),
        };

        self.store.append_message(message.clone()).await?;
        self.metrics.chat_messages_total.inc();

        let delivered = turn.publish(OrderEvent::ChatMessage(message.clone()));
        drop(turn);
        info!(
            order_id = %order_id,
            sender_id = %sender_id,
            sequence = message.sequence,
            delivered,
            "chat message relayed"
        );

        Ok(message)
    }

    /// Full history for clients that (re)open the chat.
    pub async fn history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, DispatchError> {
        if self.store.get_order(order_id).await?.is_none() {
            return Err(DispatchError::OrderNotFound(order_id));
        }
        Ok(self.store.messages(order_id).await?)
    }
}
