//! Shelter ledger: multi-intent dispatch and expense allocation for an
//! animal shelter's chat-driven bookkeeping.

pub mod allocation;
pub mod categories;
pub mod channels;
pub mod commit;
pub mod config;
pub mod confirm;
pub mod directory;
pub mod error;
pub mod extract;
pub mod intents;
pub mod llm;
pub mod media;
pub mod sequencer;
pub mod server;
pub mod store;
