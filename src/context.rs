use crate::error::{DataError, DataResult};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct CallState {
    active: bool,
    last_connection: Option<u64>,
    transactions: u64,
}

/// Per-call context carried explicitly by the caller. A transaction marks it
/// active for as long as its session is open.
#[derive(Debug, Clone)]
pub struct CallContext {
    caller_id: Arc<str>,
    state: Arc<Mutex<CallState>>,
}

impl CallContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        let caller_id: String = caller_id.into();
        Self {
            caller_id: Arc::from(caller_id),
            state: Arc::new(Mutex::new(CallState::default())),
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().active
    }

    /// Id of the first connection used by the most recent transaction attempt.
    pub fn last_connection(&self) -> Option<u64> {
        self.state.lock().last_connection
    }

    pub fn transactions_started(&self) -> u64 {
        self.state.lock().transactions
    }

    pub(crate) fn enter(&self) -> DataResult<ActiveGuard> {
        let mut state = self.state.lock();
        if state.active {
            return Err(DataError::NestedTransaction);
        }
        state.active = true;
        state.transactions += 1;
        Ok(ActiveGuard {
            state: Arc::clone(&self.state),
            first_connection: None,
        })
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new("anonymous")
    }
}

/// Clears the active flag when the session ends, on every path.
pub(crate) struct ActiveGuard {
    state: Arc<Mutex<CallState>>,
    first_connection: Option<u64>,
}

impl ActiveGuard {
    pub(crate) fn note_connection(&mut self, id: u64) {
        if self.first_connection.is_none() {
            self.first_connection = Some(id);
            self.state.lock().last_connection = Some(id);
        }
    }

    pub(crate) fn first_connection(&self) -> Option<u64> {
        self.first_connection
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.lock().active = false;
    }
}
