use foldhash::fast::RandomState;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    Envelope,
    error::{Error, ErrorKind, Result},
};

/// Correlates outbound requests with their responses.
///
/// Each in-flight request owns a dedicated oneshot channel keyed by its
/// correlation guid, so delivering one response wakes exactly that caller and
/// nobody else. A guid is unique only among outstanding requests; once the
/// response is consumed (or the wait abandoned) it leaves the map.
#[derive(Default)]
pub struct Waiter {
    pending: dashmap::DashMap<Uuid, oneshot::Sender<Result<Envelope>>, RandomState>,
}

/// RAII guard removing the pending entry when a caller abandons its wait,
/// so a late response finds no waiter and is dropped with a warning.
pub struct WaiterCleaner<'a> {
    waiter: &'a Waiter,
    message_guid: Uuid,
}

impl Drop for WaiterCleaner<'_> {
    fn drop(&mut self) {
        self.waiter.pending.remove(&self.message_guid);
    }
}

/// The receiving half of one pending request.
pub struct PendingReply<'a> {
    rx: oneshot::Receiver<Result<Envelope>>,
    cleaner: WaiterCleaner<'a>,
}

impl PendingReply<'_> {
    /// Waits for this request's response.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the session failed the entry or dropped it.
    pub async fn recv(self) -> Result<Envelope> {
        let result = self
            .rx
            .await
            .map_err(|_| Error::kind(ErrorKind::ConnectionLost))?;
        // The entry was already removed by post/fail_all.
        std::mem::forget(self.cleaner);
        result
    }
}

impl Waiter {
    /// Registers an outstanding request under its correlation guid.
    pub fn register(&self, message_guid: Uuid) -> PendingReply<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_guid, tx);
        PendingReply {
            rx,
            cleaner: WaiterCleaner {
                waiter: self,
                message_guid,
            },
        }
    }

    /// Delivers a response to its waiting caller.
    ///
    /// The entry is removed before sending, so double resolution is
    /// impossible. A response with no matching entry (timed out or abandoned)
    /// is dropped with a warning, never delivered to another caller.
    pub fn post(&self, message_guid: Uuid, envelope: Envelope) {
        if let Some((_, tx)) = self.pending.remove(&message_guid) {
            let _ = tx.send(Ok(envelope));
        } else {
            tracing::warn!("dropping orphaned response for {message_guid}");
        }
    }

    /// Fails every pending request at once, used when the connection goes
    /// down so callers are not left to time out one by one.
    pub fn fail_all(&self, kind: ErrorKind) {
        let guids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for guid in guids {
            if let Some((_, tx)) = self.pending.remove(&guid) {
                let _ = tx.send(Err(Error::kind(kind.clone())));
            }
        }
    }

    #[must_use]
    pub fn contains(&self, message_guid: Uuid) -> bool {
        self.pending.contains_key(&message_guid)
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_waiter() {
        let waiter = Arc::new(Waiter::default());

        let guid = Uuid::new_v4();
        let reply = waiter.register(guid);

        let handle = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                let mut envelope = Envelope::root_query();
                envelope.message_guid = guid;
                envelope.member_name = "DirectoryName".into();
                waiter.post(guid, envelope);
            })
        };

        let envelope = reply.recv().await.unwrap();
        assert_eq!(envelope.member_name, "DirectoryName");
        handle.await.unwrap();
        assert!(!waiter.contains(guid));

        // Abandoning the wait removes the entry through the cleaner's Drop.
        let guid = Uuid::new_v4();
        let reply = waiter.register(guid);
        drop(reply);
        assert!(!waiter.contains(guid));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let waiter = Waiter::default();
        let a = waiter.register(Uuid::new_v4());
        let b = waiter.register(Uuid::new_v4());

        waiter.fail_all(ErrorKind::ConnectionLost);

        assert_eq!(a.recv().await.unwrap_err().kind, ErrorKind::ConnectionLost);
        assert_eq!(b.recv().await.unwrap_err().kind, ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn test_orphaned_response() {
        let waiter = Waiter::default();
        let guid = Uuid::new_v4();
        // No registration: the post is dropped, not delivered anywhere.
        waiter.post(guid, Envelope::root_query());
        assert!(!waiter.contains(guid));
    }
}
