pub mod chat;
pub mod conditional;
pub mod confirmation;
pub mod fanout;
pub mod lifecycle;
pub mod matching;
pub mod tracking;
