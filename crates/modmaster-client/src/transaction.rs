//! Transaction id allocation and request/response correlation.

use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Instant;

const ID_SPACE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("all 65536 transaction ids are outstanding")]
    Exhausted,
    #[error("transaction id {0} is already outstanding")]
    InUse(u16),
}

#[derive(Debug)]
struct Pending<T> {
    deadline: Option<Instant>,
    slot: T,
}

/// Outstanding transactions keyed by MBAP transaction id.
///
/// `T` is whatever waits on the answer. An id leaves the table exactly once,
/// through [`resolve`](Self::resolve), [`expire`](Self::expire) or
/// [`drain`](Self::drain), so a late response after a timeout finds nothing.
#[derive(Debug)]
pub struct TransactionManager<T> {
    next_id: u16,
    pending: HashMap<u16, Pending<T>>,
}

impl<T> Default for TransactionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransactionManager<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Next id not currently outstanding. Ids wrap after 65535.
    pub fn allocate(&mut self) -> Result<u16, TransactionError> {
        if self.pending.len() >= ID_SPACE {
            return Err(TransactionError::Exhausted);
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Records a request as outstanding. On conflict the slot is handed back.
    pub fn register(
        &mut self,
        id: u16,
        deadline: Option<Instant>,
        slot: T,
    ) -> Result<(), (TransactionError, T)> {
        if self.pending.contains_key(&id) {
            return Err((TransactionError::InUse(id), slot));
        }
        self.pending.insert(id, Pending { deadline, slot });
        Ok(())
    }

    /// Removes and returns the request answered by `id`, if any.
    pub fn resolve(&mut self, id: u16) -> Option<T> {
        self.pending.remove(&id).map(|pending| pending.slot)
    }

    /// Removes every request whose deadline is at or before `now`, oldest
    /// deadline first.
    pub fn expire(&mut self, now: Instant) -> Vec<(u16, T)> {
        let mut due: Vec<(Instant, u16)> = self
            .pending
            .iter()
            .filter_map(|(id, pending)| match pending.deadline {
                Some(deadline) if deadline <= now => Some((deadline, *id)),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|(_, id)| self.pending.remove(&id).map(|pending| (id, pending.slot)))
            .collect()
    }

    /// Removes everything, ordered by id.
    pub fn drain(&mut self) -> Vec<(u16, T)> {
        let mut all: Vec<(u16, T)> = self
            .pending
            .drain()
            .map(|(id, pending)| (id, pending.slot))
            .collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    pub fn contains(&self, id: u16) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn deadline(&self, id: u16) -> Option<Instant> {
        self.pending.get(&id).and_then(|pending| pending.deadline)
    }

    /// Earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|pending| pending.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
