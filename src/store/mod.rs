//! Shared counter store abstraction.
//!
//! The engine never talks to a concrete client. It builds a [`Batch`] of
//! hash-field operations and hands it to a [`WindowStore`], which must apply
//! the whole batch atomically and in isolation from other batches touching
//! the same key. Two adapters are provided: [`MemoryStore`] for a single
//! process and tests, and `RedisStore` (feature `redis`) for a shared Redis.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a store adapter for a whole batch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Batch aborted: {0}")]
    Aborted(String),
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
    /// An increment hit a field that does not hold an integer. Nothing in
    /// the batch was applied.
    #[error("Field {field} of {key} is not an integer")]
    CorruptField { key: String, field: String },
}

/// A single operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Add `delta` to a hash field, creating the key and field if absent.
    IncrementField { key: String, field: String, delta: i64 },
    /// Remove a hash field. Removing an absent field is a no-op.
    DeleteField { key: String, field: String },
    /// Read a hash field.
    GetField { key: String, field: String },
    /// Remove a hash field only while it still holds `expected`.
    DiscardField {
        key: String,
        field: String,
        expected: String,
    },
    /// Set the time-to-live of the whole key.
    Expire { key: String, ttl_secs: u64 },
}

/// Result of one [`StoreOp`], in the same position as the op in its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// New value after an increment.
    Integer(i64),
    /// Raw field contents for a read, `None` when the field is absent.
    Field(Option<String>),
    /// Deletes and expiry updates carry no value.
    Done,
}

/// An ordered list of operations to be applied as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &str, field: &str, delta: i64) -> &mut Self {
        self.ops.push(StoreOp::IncrementField {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        });
        self
    }

    pub fn delete(&mut self, key: &str, field: &str) -> &mut Self {
        self.ops.push(StoreOp::DeleteField {
            key: key.to_string(),
            field: field.to_string(),
        });
        self
    }

    pub fn get(&mut self, key: &str, field: &str) -> &mut Self {
        self.ops.push(StoreOp::GetField {
            key: key.to_string(),
            field: field.to_string(),
        });
        self
    }

    pub fn discard(&mut self, key: &str, field: &str, expected: &str) -> &mut Self {
        self.ops.push(StoreOp::DiscardField {
            key: key.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
        });
        self
    }

    pub fn expire(&mut self, key: &str, ttl_secs: u64) -> &mut Self {
        self.ops.push(StoreOp::Expire {
            key: key.to_string(),
            ttl_secs,
        });
        self
    }

    /// The operations in submission order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Contract the rate engine requires from the shared store.
///
/// Implementations must apply every op of a batch or none of them, and must
/// not interleave another batch on the same key in between. Results are
/// returned in op order. Reading a field written earlier in the same batch is
/// never required.
///
/// An increment of a field that does not hold an integer must fail the whole
/// batch with [`StoreError::CorruptField`], leaving the store untouched.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Apply a batch atomically and return one outcome per op.
    async fn execute_batch(&self, batch: Batch) -> Result<Vec<OpOutcome>, StoreError>;
}
