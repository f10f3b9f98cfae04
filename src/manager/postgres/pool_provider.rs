//! Which pool each store query runs on.
//!
//! [`PostgresRequestStore`](super::PostgresRequestStore) only has one query that tolerates
//! replica lag: the `list_active` page used by sweeps and recovery. A page that is a little
//! behind costs at most one sweep interval, and the follow-up load happens under the lease on
//! the primary anyway. Create, persist, delete and the `get` that precedes every transition
//! must see the latest committed snapshot, so they run on [`PoolProvider::write`].

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Routes store queries to a primary or a replica pool.
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for `list_active` pages.
    fn read(&self) -> &PgPool;

    /// Pool for everything a transition reads or writes.
    fn write(&self) -> &PgPool;
}

/// One pool for both.
impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// A primary plus an optional streaming replica.
#[derive(Clone, Debug)]
pub struct SplitPools {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl SplitPools {
    pub fn new(primary: PgPool, replica: Option<PgPool>) -> Self {
        Self { primary, replica }
    }
}

impl PoolProvider for SplitPools {
    fn read(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}

/// Pools for `#[sqlx::test]` where the read side runs every session read-only, so a store
/// query routed to the wrong pool fails loudly instead of passing against one database.
#[derive(Clone, Debug)]
pub struct TestDbPools {
    pools: SplitPools,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let read_only = pool
            .connect_options()
            .as_ref()
            .clone()
            .options([("default_transaction_read_only", "on")]);
        let replica = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(read_only)
            .await?;

        Ok(Self {
            pools: SplitPools::new(pool, Some(replica)),
        })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        self.pools.read()
    }

    fn write(&self) -> &PgPool {
        self.pools.write()
    }
}
