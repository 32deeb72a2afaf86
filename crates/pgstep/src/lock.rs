//! Migration Lock - Cross-process serialization of migration runs
//!
//! Runs against the same database and ledger table share a 64-bit advisory
//! lock key, so only one of them applies steps at a time.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::MigrateResult;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable identity of a migration target, derived from the database name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetIdentity([u8; 32]);

impl TargetIdentity {
    /// SHA-256 of the database name
    pub fn from_database_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Advisory lock key for the (target, ledger table) pair.
///
/// FNV-1a 64 over the identity bytes followed by the table name, masked to
/// the non-negative range of a signed 64-bit key.
pub fn lock_key(target: &TargetIdentity, ledger_table: &str) -> i64 {
    let hash = target
        .as_bytes()
        .iter()
        .chain(ledger_table.as_bytes())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        });
    (hash & i64::MAX as u64) as i64
}

/// Session-scoped advisory lock.
///
/// `acquire_lock` blocks until the key is granted to this session.
#[async_trait]
pub trait AdvisoryLock: Send {
    async fn acquire_lock(&mut self, key: i64) -> MigrateResult<()>;

    async fn release_lock(&mut self, key: i64) -> MigrateResult<()>;
}
