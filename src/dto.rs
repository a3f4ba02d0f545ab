use foldhash::fast::RandomState;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    Envelope, STATE_CHANGED_EVENT,
    error::{Error, ErrorKind, Result},
    member::{Args, MemberTable},
};

/// One client connection's outbound lane for a subscribed event.
pub(crate) struct EventSink {
    pub session_id: u64,
    pub tx: mpsc::UnboundedSender<Envelope>,
}

/// The remotable capability every exposed server object embeds.
///
/// Carries the object's immutable process-wide identity and the per-event
/// subscriber bookkeeping. Domain types compose a `DtoCore` and declare their
/// visible members in a [`MemberTable`]; no remoting logic leaks into them
/// beyond calling [`notify_changed`](Self::notify_changed) on state changes.
pub struct DtoCore {
    dto_guid: Uuid,
    subscriptions: Mutex<HashMap<String, Vec<EventSink>, RandomState>>,
}

impl Default for DtoCore {
    fn default() -> Self {
        Self::new()
    }
}

impl DtoCore {
    /// Assigns a fresh identity, unique for the server process lifetime and
    /// never reused.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dto_guid: Uuid::new_v4(),
            subscriptions: Mutex::default(),
        }
    }

    #[must_use]
    pub fn dto_guid(&self) -> Uuid {
        self.dto_guid
    }

    /// How many event-adds for `event` are live with no matching remove.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    pub(crate) fn subscribe(&self, event: &str, sink: EventSink) {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(sink);
    }

    /// Removes one subscription of `session_id` for `event`.
    pub(crate) fn unsubscribe(&self, event: &str, session_id: u64) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(sinks) = subscriptions.get_mut(event) {
            if let Some(pos) = sinks.iter().position(|s| s.session_id == session_id) {
                sinks.remove(pos);
            }
            if sinks.is_empty() {
                subscriptions.remove(event);
            }
        }
    }

    /// Pushes one state-changed notification per subscribed connection.
    ///
    /// With zero subscribers the payload is never materialized and no frame
    /// goes out.
    pub fn notify_changed<V: Serialize>(&self, member: &str, value: &V) {
        if self.subscriber_count(STATE_CHANGED_EVENT) == 0 {
            return;
        }
        let payload = match serde_json::to_value(value) {
            Ok(value) => serde_json::json!({ "propertyName": member, "value": value }),
            Err(e) => {
                tracing::error!("failed to serialize change of {member}: {e}");
                return;
            }
        };
        self.push(STATE_CHANGED_EVENT, payload);
    }

    /// Pushes a named domain event to its subscribers, elided when nobody is
    /// listening.
    pub fn raise_event<V: Serialize>(&self, event: &str, payload: &V) {
        if self.subscriber_count(event) == 0 {
            return;
        }
        match serde_json::to_value(payload) {
            Ok(payload) => self.push(event, payload),
            Err(e) => tracing::error!("failed to serialize event {event}: {e}"),
        }
    }

    fn push(&self, event: &str, payload: serde_json::Value) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sinks) = subscriptions.get_mut(event) else {
            return;
        };
        // One frame per connection, even when it subscribed more than once.
        let mut notified = Vec::new();
        sinks.retain(|sink| {
            if notified.contains(&sink.session_id) {
                return true;
            }
            let envelope = Envelope::notification(self.dto_guid, event, payload.clone());
            if sink.tx.send(envelope).is_err() {
                // The connection is gone; drop its subscription.
                return false;
            }
            notified.push(sink.session_id);
            true
        });
        if sinks.is_empty() {
            subscriptions.remove(event);
        }
    }
}

impl std::fmt::Debug for DtoCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtoCore")
            .field("dto_guid", &self.dto_guid)
            .finish()
    }
}

/// Implemented by every remotable server type: hand out the embedded core and
/// the type's declared member table.
pub trait Dto: Send + Sync + 'static {
    fn core(&self) -> &DtoCore;

    fn members() -> &'static MemberTable<Self>
    where
        Self: Sized;
}

/// Type-erased view of a [`Dto`] used by the server's inbound dispatch.
///
/// The core accessor is named apart from [`Dto::core`] so concrete types
/// implementing both traits keep an unambiguous `core()`.
pub trait RemoteObject: Send + Sync {
    fn dto_core(&self) -> &DtoCore;

    /// # Errors
    fn get(&self, member: &str) -> Result<serde_json::Value>;

    /// # Errors
    fn set(&self, member: &str, value: serde_json::Value) -> Result<()>;

    /// # Errors
    fn call(&self, member: &str, args: &[serde_json::Value]) -> Result<serde_json::Value>;

    /// The object's current state as one JSON object including its identity,
    /// the shape every object reference takes on the wire.
    ///
    /// # Errors
    fn full_state(&self) -> Result<serde_json::Value>;
}

impl<T: Dto> RemoteObject for T {
    fn dto_core(&self) -> &DtoCore {
        Dto::core(self)
    }

    fn get(&self, member: &str) -> Result<serde_json::Value> {
        T::members().get(self, member)
    }

    fn set(&self, member: &str, value: serde_json::Value) -> Result<()> {
        T::members().set(self, member, value)
    }

    fn call(&self, member: &str, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        T::members().call(self, member, Args(args))
    }

    fn full_state(&self) -> Result<serde_json::Value> {
        let mut state = T::members().full_state(self)?;
        state.insert(
            "dtoGuid".to_string(),
            serde_json::to_value(Dto::core(self).dto_guid())
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?,
        );
        Ok(serde_json::Value::Object(state))
    }
}

/// Server-side table of every object currently reachable by clients.
///
/// Owned by one [`RemoteServer`](crate::RemoteServer), not ambient process
/// state, so independent servers in one process (or one test) never share it.
#[derive(Default)]
pub struct DtoRegistry {
    objects: dashmap::DashMap<Uuid, Arc<dyn RemoteObject>, RandomState>,
}

impl DtoRegistry {
    /// Makes `dto` addressable by clients under its own identity.
    pub fn expose(&self, dto: Arc<dyn RemoteObject>) {
        self.objects.insert(dto.dto_core().dto_guid(), dto);
    }

    /// Withdraws the object; later requests for it answer `StaleReference`.
    pub fn retire(&self, dto_guid: Uuid) {
        self.objects.remove(&dto_guid);
    }

    /// # Errors
    ///
    /// `StaleReference` for an id the server does not (or no longer does)
    /// expose.
    pub fn lookup(&self, dto_guid: Uuid) -> Result<Arc<dyn RemoteObject>> {
        self.objects
            .get(&dto_guid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::StaleReference,
                    format!("object not exposed: {dto_guid}"),
                )
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl std::fmt::Debug for DtoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtoRegistry")
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;
    use std::sync::LazyLock;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Job {
        core: DtoCore,
        progress: AtomicI64,
    }

    impl Job {
        fn new() -> Self {
            Self {
                core: DtoCore::new(),
                progress: AtomicI64::new(0),
            }
        }

        fn set_progress(&self, value: i64) {
            self.progress.store(value, Ordering::Release);
            self.core.notify_changed("Progress", &value);
        }
    }

    impl Dto for Job {
        fn core(&self) -> &DtoCore {
            &self.core
        }

        fn members() -> &'static MemberTable<Self> {
            static MEMBERS: LazyLock<MemberTable<Job>> = LazyLock::new(|| {
                MemberTable::new()
                    .getter("Progress", |job: &Job| job.progress.load(Ordering::Acquire))
                    .setter("Progress", Job::set_progress)
                    .method("Abort", |job: &Job, _| {
                        job.set_progress(-1);
                        Ok(())
                    })
            });
            &MEMBERS
        }
    }

    #[tokio::test]
    async fn test_notification_elision() {
        let job = Job::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Zero subscribers: no frame goes out.
        job.set_progress(10);
        assert_eq!(job.core.subscriber_count(STATE_CHANGED_EVENT), 0);

        job.core.subscribe(
            STATE_CHANGED_EVENT,
            EventSink {
                session_id: 1,
                tx: tx.clone(),
            },
        );
        job.set_progress(20);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.message_type, MessageType::EventNotification);
        assert_eq!(envelope.dto_guid, job.core.dto_guid());
        assert_eq!(envelope.member_name, STATE_CHANGED_EVENT);
        let payload = envelope.response.unwrap();
        assert_eq!(payload["propertyName"], "Progress");
        assert_eq!(payload["value"], 20);
        // Exactly one frame per change.
        assert!(rx.try_recv().is_err());

        job.core.unsubscribe(STATE_CHANGED_EVENT, 1);
        job.set_progress(30);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_frame_per_connection() {
        let job = Job::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..2 {
            job.core.subscribe(
                STATE_CHANGED_EVENT,
                EventSink {
                    session_id: 7,
                    tx: tx.clone(),
                },
            );
        }
        assert_eq!(job.core.subscriber_count(STATE_CHANGED_EVENT), 2);

        job.set_progress(5);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = DtoRegistry::default();
        assert!(registry.is_empty());
        let job = Arc::new(Job::new());
        registry.expose(job.clone());
        assert!(!registry.is_empty());

        let remote = registry.lookup(job.core.dto_guid()).unwrap();
        remote.set("Progress", serde_json::json!(42)).unwrap();
        assert_eq!(remote.get("Progress").unwrap(), serde_json::json!(42));
        assert_eq!(
            remote.get("Missing").unwrap_err().kind,
            ErrorKind::UnknownMember
        );

        let state = remote.full_state().unwrap();
        assert_eq!(state["Progress"], 42);
        assert_eq!(
            state["dtoGuid"],
            serde_json::to_value(job.core.dto_guid()).unwrap()
        );

        registry.retire(job.core.dto_guid());
        assert!(registry.is_empty());
        assert_eq!(
            registry.lookup(job.core.dto_guid()).err().unwrap().kind,
            ErrorKind::StaleReference
        );
    }
}
