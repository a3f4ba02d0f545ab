use foldhash::fast::RandomState;
use std::sync::Arc;
use uuid::Uuid;

use crate::{proxy::DtoProxy, session::ClientSession};

/// Maps a server object's identity to the single proxy standing in for it.
///
/// The registry is the one source of truth for "is this the same remote
/// object": every resolution of an id returns the identical `Arc`, so
/// consumers may compare proxies by reference. Proxies are created lazily on
/// first reference and populated in place afterwards, never replaced. Owned
/// by one [`ClientSession`], so independent connections keep independent
/// object worlds.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: dashmap::DashMap<Uuid, Arc<DtoProxy>, RandomState>,
}

impl ProxyRegistry {
    /// Returns the proxy for `dto_guid`, creating and registering it on first
    /// reference. Resolution is atomic per id: two concurrent first
    /// references still end up with one shared instance.
    pub fn resolve(&self, dto_guid: Uuid, session: &Arc<ClientSession>) -> Arc<DtoProxy> {
        self.proxies
            .entry(dto_guid)
            .or_insert_with(|| Arc::new(DtoProxy::new(dto_guid, Arc::downgrade(session))))
            .value()
            .clone()
    }

    /// Looks up the routing target of an inbound notification; `None` when
    /// the client never referenced that object.
    #[must_use]
    pub fn notify_targets_of(&self, dto_guid: Uuid) -> Option<Arc<DtoProxy>> {
        self.proxies.get(&dto_guid).map(|entry| entry.value().clone())
    }

    /// Forgets the proxy for `dto_guid`. No wire message is sent; callers
    /// wanting the server to stop pushing events unsubscribe first.
    pub fn drop_proxy(&self, dto_guid: Uuid) {
        self.proxies.remove(&dto_guid);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("proxies", &self.proxies.len())
            .finish()
    }
}
