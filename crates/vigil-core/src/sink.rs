use crate::event::EventRow;
use crate::gallery::PersonRecord;
use crate::types::OwnerId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Persistence backend: reads the members gallery, writes event batches.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// All person records owned by `owner`, in backend order.
    async fn load_gallery(&self, owner: &OwnerId) -> Result<Vec<PersonRecord>, SinkError>;

    /// Insert one batch of normalized rows. All-or-nothing.
    async fn insert_events(&self, batch: &[EventRow]) -> Result<(), SinkError>;
}
