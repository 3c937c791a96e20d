pub mod chat;
pub mod driver;
pub mod event;
pub mod order;
