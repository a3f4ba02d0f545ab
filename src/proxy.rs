use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use uuid::Uuid;

use crate::{
    Envelope, MessageType, STATE_CHANGED_EVENT,
    error::{Error, ErrorKind, Result},
    session::ClientSession,
};

type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Token returned by [`DtoProxy::add_event`], identifying one attached
/// handler for a later [`DtoProxy::remove_event`]. Consumed by the removal,
/// so a handler cannot be detached twice.
#[derive(Debug, PartialEq, Eq)]
pub struct EventSubscription {
    event: String,
    id: u64,
}

/// Client-side stand-in for one server-resident object.
///
/// Holds the server's identity, a locally populated field cache, and the
/// attached event handlers. All typed accessors go over the wire through the
/// owning session; [`field`](Self::field) reads the cache without a round
/// trip. Instances are created and deduplicated by the session's
/// [`ProxyRegistry`](crate::ProxyRegistry) only.
pub struct DtoProxy {
    dto_guid: Uuid,
    session: Weak<ClientSession>,
    fields: RwLock<serde_json::Map<String, serde_json::Value>>,
    handlers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    handler_seq: AtomicU64,
}

impl DtoProxy {
    pub(crate) fn new(dto_guid: Uuid, session: Weak<ClientSession>) -> Self {
        Self {
            dto_guid,
            session,
            fields: RwLock::default(),
            handlers: Mutex::default(),
            handler_seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn dto_guid(&self) -> Uuid {
        self.dto_guid
    }

    fn session(&self) -> Result<Arc<ClientSession>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::ConnectionLost, "session dropped".into()))
    }

    /// Fetches the remote property's current value.
    ///
    /// # Errors
    pub async fn get<T: DeserializeOwned>(&self, member: &str) -> Result<T> {
        let request = Envelope::request(self.dto_guid, MessageType::Get, member, vec![]);
        self.session()?.round_trip(request).await?.result_as()
    }

    /// Writes the remote property and waits for the server's acknowledgement,
    /// so dispatch failures surface to this caller.
    ///
    /// # Errors
    pub async fn set<V: Serialize>(&self, member: &str, value: &V) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
        let request = Envelope::request(self.dto_guid, MessageType::Set, member, vec![value]);
        self.session()?.round_trip(request).await?.into_result()?;
        Ok(())
    }

    /// Calls the remote method and decodes its result as `T`.
    ///
    /// # Errors
    pub async fn query<T: DeserializeOwned>(
        &self,
        method: &str,
        parameters: Vec<serde_json::Value>,
    ) -> Result<T> {
        let request = Envelope::request(self.dto_guid, MessageType::Query, method, parameters);
        self.session()?.round_trip(request).await?.result_as()
    }

    /// Calls a remote method whose result is another remote object; the
    /// reference is resolved through the session's identity registry.
    ///
    /// # Errors
    pub async fn query_object(
        &self,
        method: &str,
        parameters: Vec<serde_json::Value>,
    ) -> Result<Arc<DtoProxy>> {
        let session = self.session()?;
        let request = Envelope::request(self.dto_guid, MessageType::Query, method, parameters);
        let value = session.round_trip(request).await?.into_result()?;
        session.object_from_value(&value)
    }

    /// Fire-and-forget method call: the frame is handed to the writer and no
    /// result is awaited.
    ///
    /// # Errors
    pub async fn invoke(&self, method: &str, parameters: Vec<serde_json::Value>) -> Result<()> {
        let request = Envelope::request(self.dto_guid, MessageType::Invoke, method, parameters);
        self.session()?.send(request).await
    }

    /// Reads a field from the local cache without a round trip. Populated by
    /// the state-changed subscription sync and later push notifications.
    ///
    /// # Errors
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let fields = self
            .fields
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let value = fields.get(name).ok_or_else(|| {
            Error::new(ErrorKind::InvalidState, format!("field not populated: {name}"))
        })?;
        serde_json::from_value(value.clone()).map_err(Error::from)
    }

    /// Attaches a local handler for a remote event. The first handler for an
    /// event registers the subscription with the server; for
    /// [`STATE_CHANGED_EVENT`] the registration response carries the object's
    /// full current state, which is applied to the field cache before this
    /// returns, so a fresh proxy is never silently stale.
    ///
    /// # Errors
    pub async fn add_event<F>(&self, event: &str, handler: F) -> Result<EventSubscription>
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let id = self.handler_seq.fetch_add(1, Ordering::AcqRel);
        let first = {
            let mut handlers = self
                .handlers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = handlers.entry(event.to_string()).or_default();
            let first = entry.is_empty();
            entry.push((id, Arc::new(handler)));
            first
        };

        if first {
            let request = Envelope::request(self.dto_guid, MessageType::EventAdd, event, vec![]);
            let result = async {
                let response = self.session()?.round_trip(request).await?;
                let value = response.into_result()?;
                if event == STATE_CHANGED_EVENT {
                    self.apply_update(&value);
                }
                Ok(())
            }
            .await;
            if let Err(e) = result {
                self.detach(event, id);
                // The server may have registered the sink before the reply
                // was lost; walk that back. Removing an absent subscription
                // is a no-op there.
                let rollback =
                    Envelope::request(self.dto_guid, MessageType::EventRemove, event, vec![]);
                if let Ok(session) = self.session() {
                    let _ = session.send(rollback).await;
                }
                return Err(e);
            }
        }

        Ok(EventSubscription {
            event: event.to_string(),
            id,
        })
    }

    /// Detaches a handler; dropping the last handler for an event
    /// unregisters the subscription with the server.
    ///
    /// # Errors
    pub async fn remove_event(&self, subscription: EventSubscription) -> Result<()> {
        if self.detach(&subscription.event, subscription.id) {
            let request = Envelope::request(
                self.dto_guid,
                MessageType::EventRemove,
                subscription.event,
                vec![],
            );
            self.session()?.send(request).await?;
        }
        Ok(())
    }

    /// Removes the handler locally; true when it was the last one for the
    /// event.
    fn detach(&self, event: &str, id: u64) -> bool {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = handlers.get_mut(event) else {
            return false;
        };
        entry.retain(|(handler_id, _)| *handler_id != id);
        if entry.is_empty() {
            handlers.remove(event);
            true
        } else {
            false
        }
    }

    /// Merges a server-sent state object into the field cache in place. The
    /// registry entry itself is never replaced.
    pub(crate) fn apply_update(&self, value: &serde_json::Value) {
        let Some(object) = value.as_object() else {
            return;
        };
        let mut fields = self
            .fields
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (name, value) in object {
            if name != "dtoGuid" {
                fields.insert(name.clone(), value.clone());
            }
        }
    }

    /// Routes an inbound push notification: state changes refresh the field
    /// cache first, then the event's local handlers run.
    pub(crate) fn handle_notification(&self, envelope: &Envelope) {
        let payload = envelope.response.clone().unwrap_or(serde_json::Value::Null);
        if envelope.member_name == STATE_CHANGED_EVENT
            && let (Some(name), Some(value)) = (
                payload.get("propertyName").and_then(|v| v.as_str()),
                payload.get("value"),
            )
        {
            let mut fields = self
                .fields
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            fields.insert(name.to_string(), value.clone());
        }

        let handlers: Vec<EventHandler> = {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            handlers
                .get(&envelope.member_name)
                .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&payload);
        }
    }
}

impl std::fmt::Debug for DtoProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtoProxy")
            .field("dto_guid", &self.dto_guid)
            .finish()
    }
}
