//! Transaction helpers
//!
//! Every engine operation runs inside an explicit transaction at
//! read-committed isolation, read-only for the query surfaces and read-write
//! for the document protocol. Dropping an uncommitted transaction rolls it
//! back, so early returns through `?` keep the rollback-on-error contract.

use tokio_postgres::{Client, IsolationLevel, Transaction};

use crate::error::{Error, Result};

/// Begin a read-only transaction at read-committed isolation.
pub async fn read_only(client: &mut Client) -> Result<Transaction<'_>> {
    begin(client, true).await
}

/// Begin a read-write transaction at read-committed isolation.
pub async fn read_write(client: &mut Client) -> Result<Transaction<'_>> {
    begin(client, false).await
}

async fn begin(client: &mut Client, read_only: bool) -> Result<Transaction<'_>> {
    client
        .build_transaction()
        .isolation_level(IsolationLevel::ReadCommitted)
        .read_only(read_only)
        .start()
        .await
        .map_err(|e| Error::Internal(format!("cannot begin transaction: {e}")))
}
