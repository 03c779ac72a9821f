//! CSV adapters used by the replay binary.

pub mod event_reader;
pub mod progress_writer;
