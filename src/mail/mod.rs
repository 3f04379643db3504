//! Mail access — IMAP transport, message mapping, and the gateway trait.

pub mod gateway;
pub mod imap;
pub mod message;

pub use gateway::{ImapGateway, MailFlag, MailGateway};
