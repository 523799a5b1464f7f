pub mod ack_table;
pub mod message;
pub mod message_receiver;
pub mod message_sender;
