//! Client Pool Module
//!
//! Registry of every client created during a test run. Clients are only
//! guaranteed to be closed by `clear_all`, which the test-run-ended hook calls;
//! nothing relies on clients being closed when dropped.

use crate::client::ProtocolClient;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;

/// Aggregated failures from one `clear_all` pass
#[derive(Debug, Error)]
#[error("{} client(s) failed to close: {}", .failures.len(), .failures.join("; "))]
pub struct PoolError {
    pub failures: Vec<String>,
}

#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<Vec<Arc<dyn ProtocolClient>>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload.downcast_ref::<&str>().copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool shared by every sampler in this process
    pub fn global() -> Arc<ClientPool> {
        static GLOBAL: OnceLock<Arc<ClientPool>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ClientPool::new())))
    }

    fn clients(&self) -> MutexGuard<'_, Vec<Arc<dyn ProtocolClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client for teardown at the end of the run
    pub fn add(&self, client: Arc<dyn ProtocolClient>) {
        log::debug!("Adding client {} to pool", client.client_id());
        self.clients().push(client);
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Close and forget every registered client.
    ///
    /// Every client is attempted even when earlier ones fail. A client counts
    /// as failed when `close` panics or it still reports connected afterwards.
    pub fn clear_all(&self) -> Result<(), PoolError> {
        // Take the clients first so close() never runs under the pool lock.
        let clients = std::mem::take(&mut *self.clients());
        if clients.is_empty() {
            return Ok(());
        }
        log::debug!("Closing {} pooled client(s)", clients.len());

        let mut failures = Vec::new();
        for client in clients {
            let closed = panic::catch_unwind(AssertUnwindSafe(|| client.close()));
            match closed {
                Err(payload) => failures.push(format!(
                    "{} panicked while closing: {}",
                    client.client_id(),
                    panic_message(payload.as_ref())
                )),
                Ok(()) if client.is_connected() => failures.push(format!(
                    "{} still connected to {}",
                    client.client_id(),
                    client.broker_address()
                )),
                Ok(()) => {}
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError { failures })
        }
    }
}
