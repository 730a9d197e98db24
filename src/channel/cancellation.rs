use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::types::{FsError, FsResult};

/// Set by INTERRUPT, polled by handlers before side effects they cannot undo.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, operation: &str) -> FsResult<()> {
        if self.is_cancelled() {
            return Err(FsError::cancelled(operation));
        }
        Ok(())
    }
}

/// Requests submitted but not yet answered, keyed by their `unique`.
#[derive(Default)]
pub struct PendingRequests {
    tokens: Mutex<HashMap<u64, CancellationToken>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unique: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(unique, token.clone());
        token
    }

    /// Returns false when the request already completed.
    pub fn interrupt(&self, unique: u64) -> bool {
        match self.tokens.lock().get(&unique) {
            Some(token) => {
                debug!("interrupting request {}", unique);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, unique: u64) {
        self.tokens.lock().remove(&unique);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_interrupt_cancels_registered_request() {
        let pending = PendingRequests::new();
        let token = pending.register(7);
        assert!(token.check("WRITE").is_ok());
        assert!(pending.interrupt(7));
        assert_eq!(token.check("WRITE").unwrap_err().kind(), ErrorKind::Cancelled);

        pending.complete(7);
        assert!(!pending.interrupt(7));
        assert!(pending.is_empty());
    }
}
