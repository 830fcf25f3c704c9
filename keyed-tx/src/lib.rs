//! # Keyed transactions
//!
//! A [`TransactionManager`] tracks open transactions by an application-chosen
//! string key. Call sites that agree on a key share one unit of work without
//! passing a transaction handle between them.
//!
//! Operations on the same key are serialized through a per-key lock, while
//! operations on unrelated keys never contend.
//!
//! ```
//! # use keyed_tx::{
//! #     TransactionBackend, TransactionCoordinator, TransactionError, TransactionManager,
//! # };
//! # #[derive(Debug)]
//! # struct Noop;
//! # #[async_trait::async_trait]
//! # impl TransactionBackend for Noop {
//! #     type Transaction = ();
//! #     async fn begin(&self) -> Result<(), TransactionError> { Ok(()) }
//! #     async fn commit(&self, _: ()) -> Result<(), TransactionError> { Ok(()) }
//! #     async fn rollback(&self, _: ()) -> Result<(), TransactionError> { Ok(()) }
//! # }
//! # async fn example() -> Result<(), TransactionError> {
//! let manager = TransactionManager::new(Noop);
//! manager.begin("manifest:library/alpine:latest").await?;
//! assert!(manager.begin("manifest:library/alpine:latest").await.is_err());
//! manager.commit("manifest:library/alpine:latest").await?;
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc};

use dashmap::DashMap;

/// Errors from beginning or finishing a keyed transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// A transaction is already registered under this key.
    #[error("transaction key already in use: {0}")]
    InUse(String),

    /// No transaction is registered under this key.
    #[error("transaction already closed: {0}")]
    Closed(String),

    /// The backend failed to open or finish the transaction.
    #[error("transaction backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Opens and finishes the underlying transactions.
#[async_trait::async_trait]
pub trait TransactionBackend: Send + Sync {
    /// The transaction handle.
    type Transaction: Send + 'static;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Transaction, TransactionError>;

    /// Make the transaction's writes durable.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), TransactionError>;

    /// Discard the transaction's writes.
    async fn rollback(&self, tx: Self::Transaction) -> Result<(), TransactionError>;
}

/// Begin, commit and roll back transactions identified by a key.
#[async_trait::async_trait]
pub trait TransactionCoordinator: Send + Sync {
    /// Open a transaction under `key`.
    ///
    /// Fails with [`TransactionError::InUse`] when one is already open.
    async fn begin(&self, key: &str) -> Result<(), TransactionError>;

    /// Commit the transaction under `key`.
    ///
    /// Fails with [`TransactionError::Closed`] when none is open.
    async fn commit(&self, key: &str) -> Result<(), TransactionError>;

    /// Roll back the transaction under `key`.
    ///
    /// Fails with [`TransactionError::Closed`] when none is open.
    async fn rollback(&self, key: &str) -> Result<(), TransactionError>;
}

type Handle<T> = Arc<parking_lot::Mutex<Option<T>>>;

/// Registry of open transactions keyed by string.
pub struct TransactionManager<B: TransactionBackend> {
    backend: B,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: DashMap<String, Handle<B::Transaction>>,
}

impl<B> fmt::Debug for TransactionManager<B>
where
    B: TransactionBackend + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.backend)
            .field("active", &self.active.len())
            .finish()
    }
}

impl<B> TransactionManager<B>
where
    B: TransactionBackend,
{
    /// Create a manager with no open transactions.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// The transaction backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether a transaction is open under `key`.
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains_key(key)
    }

    /// Number of open transactions.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no transactions are open.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Run `f` against the transaction open under `key`.
    pub fn with<F, R>(&self, key: &str, f: F) -> Result<R, TransactionError>
    where
        F: FnOnce(&mut B::Transaction) -> R,
    {
        let handle = self
            .active
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransactionError::Closed(key.to_owned()))?;

        let mut guard = handle.lock();
        let tx = guard
            .as_mut()
            .ok_or_else(|| TransactionError::Closed(key.to_owned()))?;
        Ok(f(tx))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(key.to_owned()).or_default().value())
    }

    // Forget the per-key lock once nobody else is holding or waiting on it.
    fn release(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn take(&self, key: &str) -> Result<B::Transaction, TransactionError> {
        let (_, handle) = self
            .active
            .remove(key)
            .ok_or_else(|| TransactionError::Closed(key.to_owned()))?;
        let tx = handle.lock().take();
        tx.ok_or_else(|| TransactionError::Closed(key.to_owned()))
    }
}

#[async_trait::async_trait]
impl<B> TransactionCoordinator for TransactionManager<B>
where
    B: TransactionBackend,
{
    async fn begin(&self, key: &str) -> Result<(), TransactionError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            if self.active.contains_key(key) {
                Err(TransactionError::InUse(key.to_owned()))
            } else {
                match self.backend.begin().await {
                    Ok(tx) => {
                        self.active
                            .insert(key.to_owned(), Arc::new(parking_lot::Mutex::new(Some(tx))));
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
        };
        self.release(key, lock);

        match &result {
            Ok(()) => tracing::debug!(%key, "transaction started"),
            Err(error) => tracing::debug!(%key, %error, "transaction not started"),
        }
        result
    }

    async fn commit(&self, key: &str) -> Result<(), TransactionError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            match self.take(key) {
                Ok(tx) => self.backend.commit(tx).await,
                Err(error) => Err(error),
            }
        };
        self.release(key, lock);

        tracing::debug!(%key, ok = result.is_ok(), "transaction committed");
        result
    }

    async fn rollback(&self, key: &str) -> Result<(), TransactionError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            match self.take(key) {
                Ok(tx) => self.backend.rollback(tx).await,
                Err(error) => Err(error),
            }
        };
        self.release(key, lock);

        tracing::debug!(%key, ok = result.is_ok(), "transaction rolled back");
        result
    }
}
