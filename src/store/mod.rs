//! Persistence layer: durable record log for processing items.

pub mod log;
pub mod record;
pub mod recovery;
pub mod traits;

pub use log::JsonlRecordStore;
pub use record::{ItemPatch, ItemStatus, ProcessingItem};
pub use traits::RecordStore;
