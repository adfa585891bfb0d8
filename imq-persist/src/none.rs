use async_trait::async_trait;

use crate::{PendingPacket, Persist, Result, StoreOutcome, Visitor};

/// Accepts every write and remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonePersist;

#[async_trait]
impl Persist for NonePersist {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn store(&self, _key: &str, _packet: PendingPacket) -> Result<StoreOutcome> {
        Ok(StoreOutcome::Stored)
    }

    async fn load(&self, _key: &str) -> Result<Option<PendingPacket>> {
        Ok(None)
    }

    async fn for_each(&self, _f: &mut Visitor<'_>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}
