use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

// ============================================================================
// Critical Sections - One In-Flight Command per Aggregate Id
// ============================================================================
//
// A table of id -> async mutex, with explicit waiter counting:
//
//   enter(id)  holders += 1 (entry created on first use), then wait for the
//              id's mutex
//   drop       release the mutex, holders -= 1, entry removed at zero
//
// "holders" counts both the running command and everyone queued behind it,
// so an entry lives exactly as long as somebody needs it. Removal happens
// synchronously in Drop; nothing depends on a collector.
//
// The table only serializes work inside this process. Conflicts across
// processes are caught by the aggregate store's sequence check.
//
// ============================================================================

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

#[derive(Clone, Default)]
pub struct CriticalSections {
    table: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl CriticalSections {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        // The table is consistent after every statement, so a poisoned lock is
        // still safe to use.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until no other command holds `id`, then holds it until the
    /// returned guard is dropped.
    pub async fn enter(&self, id: Uuid) -> CriticalSection {
        let lock = {
            let mut table = self.table();
            let slot = table.entry(id).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            slot.lock.clone()
        };

        // Registered before awaiting: if this future is dropped while queued,
        // the ticket still gives the slot back.
        let ticket = Ticket {
            sections: self.clone(),
            id,
        };
        let guard = lock.lock_owned().await;

        CriticalSection {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Ids that currently have a running or waiting command.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn leave(&self, id: Uuid) {
        let mut table = self.table();
        if let Some(slot) = table.get_mut(&id) {
            slot.holders -= 1;
            if slot.holders == 0 {
                table.remove(&id);
            }
        }
    }
}

impl std::fmt::Debug for CriticalSections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalSections")
            .field("occupied", &self.len())
            .finish()
    }
}

struct Ticket {
    sections: CriticalSections,
    id: Uuid,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.sections.leave(self.id);
    }
}

/// Exclusive hold on one aggregate id.
///
/// Field order matters: the mutex guard drops before the ticket, so the
/// entry is never removed while its mutex is still held.
pub struct CriticalSection {
    _guard: OwnedMutexGuard<()>,
    _ticket: Ticket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_uncontended_entry_is_removed_on_release() {
        let sections = CriticalSections::new();
        let id = Uuid::new_v4();

        let held = sections.enter(id).await;
        assert_eq!(sections.len(), 1);

        drop(held);
        assert!(sections.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let sections = CriticalSections::new();
        let id = Uuid::new_v4();
        let first_done = Arc::new(AtomicBool::new(false));

        let held = sections.enter(id).await;

        let waiter = {
            let sections = sections.clone();
            let first_done = first_done.clone();
            tokio::spawn(async move {
                let _held = sections.enter(id).await;
                first_done.load(Ordering::SeqCst)
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(sections.len(), 1);

        first_done.store(true, Ordering::SeqCst);
        drop(held);

        assert!(waiter.await.unwrap(), "waiter ran before the holder released");
        assert!(sections.is_empty());
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block_each_other() {
        let sections = CriticalSections::new();

        let _a = sections.enter(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_secs(1), sections.enter(Uuid::new_v4())).await;

        assert!(b.is_ok());
        assert_eq!(sections.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_its_slot_back() {
        let sections = CriticalSections::new();
        let id = Uuid::new_v4();
        let held = sections.enter(id).await;

        let timed_out = tokio::time::timeout(Duration::from_millis(20), sections.enter(id)).await;
        assert!(timed_out.is_err());

        drop(held);
        assert!(sections.is_empty());
    }
}
