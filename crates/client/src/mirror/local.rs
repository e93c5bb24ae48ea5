//! Direct mirror writes for a mirror database in the same process.

use async_trait::async_trait;
use crmsync_core::{Collection, Document, MirrorDb, OrderingToken};

use super::{MirrorError, MirrorSink};

#[async_trait]
impl MirrorSink for MirrorDb {
    async fn upsert(
        &self, collection: Collection, id: &str, document: &Document, token: Option<OrderingToken>,
    ) -> Result<(), MirrorError> {
        let applied = MirrorDb::upsert(self, collection, id, document, token).await?;
        if !applied {
            tracing::debug!(%collection, id, "mirror row already newer; upsert ignored");
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str, token: Option<OrderingToken>) -> Result<(), MirrorError> {
        MirrorDb::delete(self, collection, id, token).await?;
        Ok(())
    }
}
