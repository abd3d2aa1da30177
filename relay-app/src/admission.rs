//! Global cap on in-flight generation requests.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Non-blocking counting gate. Work that cannot get a ticket is turned away,
/// never queued.
#[derive(Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    ceiling: usize,
}

/// One unit of admitted capacity. Dropping it releases the unit, so every
/// exit path of the guarded work (including unwinding) gives it back.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(ceiling: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    pub fn try_acquire(&self) -> Option<AdmissionTicket> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(AdmissionTicket { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                tracing::error!("admission semaphore closed; rejecting request");
                None
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.ceiling.saturating_sub(self.permits.available_permits())
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}
