//! Per-relay state: connection status, trust counters and relay-side
//! subscription groups
//!
//! A `RelayHandle` owns everything the engine knows about one remote peer.
//! The wire itself lives behind [`RelayTransport`]; the handle tracks status,
//! runs the signature-sampling policy, and multiplexes logical subscriptions
//! onto relay-side REQs. Subscriptions with identical filter lists that allow
//! a grouping delay share a single REQ; inbound events and EOSE notices are
//! fanned out to every member.

use crate::config::EngineConfig;
use crate::sampler::ValidationSampler;
use crate::subscription_coordinator::CoordinatorMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use nostr_sdk::prelude::*;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Errors surfaced by transport implementations. Logged, never fatal to a
/// subscription.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Relay not connected: {0}")]
    NotConnected(RelayUrl),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Outbound wire operations the engine needs from a connection layer
#[async_trait]
pub trait RelayTransport: Send + Sync + std::fmt::Debug + 'static {
    async fn send_req(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
        filters: &[Filter],
    ) -> Result<(), TransportError>;

    async fn send_close(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
    ) -> Result<(), TransportError>;
}

/// Connection status of a relay, driven by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayStatus {
    /// Handle created, no connection attempt yet
    Initialized = 0,
    /// Connection attempt in progress
    Connecting = 1,
    /// Connected and usable
    Connected = 2,
    /// Connection lost, may come back
    Disconnected = 3,
    /// Permanently closed
    Terminated = 4,
}

impl RelayStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            4 => Self::Terminated,
            _ => Self::Initialized,
        }
    }
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug)]
struct AtomicRelayStatus(AtomicU8);

impl AtomicRelayStatus {
    fn new(status: RelayStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> RelayStatus {
        RelayStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, status: RelayStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// One logical subscription's membership in a relay-side REQ
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub subscription_id: SubscriptionId,
    pub sender: flume::Sender<CoordinatorMessage>,
}

impl GroupMember {
    pub fn new(subscription_id: SubscriptionId, sender: flume::Sender<CoordinatorMessage>) -> Self {
        Self {
            subscription_id,
            sender,
        }
    }
}

/// A relay-side REQ shared by one or more logical subscriptions
struct RelayGroup {
    relay_sub_id: SubscriptionId,
    fingerprint: Option<String>,
    filters: Vec<Filter>,
    members: RwLock<Vec<GroupMember>>,
    /// New members may join only while this is set; cleared when the REQ
    /// goes on the wire or the group dies.
    joinable: AtomicBool,
    sent: AtomicBool,
}

impl RelayGroup {
    fn new(fingerprint: Option<String>, filters: Vec<Filter>, joinable: bool) -> Self {
        Self {
            relay_sub_id: SubscriptionId::generate(),
            fingerprint,
            filters,
            members: RwLock::new(Vec::new()),
            joinable: AtomicBool::new(joinable),
            sent: AtomicBool::new(false),
        }
    }

    /// Add a member if the join window is still open
    fn try_join(&self, member: GroupMember) -> bool {
        let mut members = self.members.write();
        if !self.joinable.load(Ordering::SeqCst) {
            return false;
        }
        members.push(member);
        true
    }

    fn member_senders(&self) -> Vec<flume::Sender<CoordinatorMessage>> {
        self.members
            .read()
            .iter()
            .map(|member| member.sender.clone())
            .collect()
    }
}

impl std::fmt::Debug for RelayGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayGroup")
            .field("relay_sub_id", &self.relay_sub_id)
            .field("fingerprint", &self.fingerprint)
            .field("members", &self.members.read().len())
            .field("sent", &self.sent.load(Ordering::SeqCst))
            .finish()
    }
}

/// The engine's view of one remote relay
pub struct RelayHandle {
    url: RelayUrl,
    status: AtomicRelayStatus,
    sampler: ValidationSampler,
    transport: Arc<dyn RelayTransport>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    groups_by_sub: DashMap<SubscriptionId, Arc<RelayGroup>>,
    pending_by_fingerprint: DashMap<String, Arc<RelayGroup>>,
    groups_by_member: DashMap<SubscriptionId, Arc<RelayGroup>>,
}

impl RelayHandle {
    pub fn new(
        url: RelayUrl,
        transport: Arc<dyn RelayTransport>,
        config: &EngineConfig,
        tracker: TaskTracker,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            url,
            status: AtomicRelayStatus::new(RelayStatus::Initialized),
            sampler: ValidationSampler::new(config),
            transport,
            tracker,
            cancellation_token,
            groups_by_sub: DashMap::new(),
            pending_by_fingerprint: DashMap::new(),
            groups_by_member: DashMap::new(),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        self.status.load()
    }

    pub fn set_status(&self, status: RelayStatus) {
        debug!(relay = %self.url, %status, "relay status changed");
        self.status.store(status);
    }

    pub fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    /// Sampling contract: whether the next event from this relay must be
    /// cryptographically verified
    pub fn should_validate_event(&self) -> bool {
        self.sampler.should_validate()
    }

    pub fn add_validated_event(&self) {
        self.sampler.add_validated();
    }

    pub fn add_non_validated_event(&self) {
        self.sampler.add_non_validated();
    }

    pub fn trusted(&self) -> bool {
        self.sampler.trusted()
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.sampler.set_trusted(trusted);
    }

    pub fn sampler(&self) -> &ValidationSampler {
        &self.sampler
    }

    /// Number of relay-side REQs currently tracked (live and pending)
    pub fn active_group_count(&self) -> usize {
        self.groups_by_sub.len()
    }

    /// Start streaming `filters` for a logical subscription.
    ///
    /// With a grouping delay the subscription joins a pending REQ with an
    /// identical filter list when one exists, otherwise it opens one that
    /// fires after the delay. Without a delay a private REQ goes out
    /// immediately. Returns the relay-side subscription id.
    pub fn subscribe(
        self: &Arc<Self>,
        member: GroupMember,
        filters: Vec<Filter>,
        groupable_delay: Option<Duration>,
    ) -> SubscriptionId {
        let local_id = member.subscription_id.clone();
        match groupable_delay {
            None => {
                let group = Arc::new(RelayGroup::new(None, filters, false));
                group.members.write().push(member);
                self.groups_by_sub
                    .insert(group.relay_sub_id.clone(), group.clone());
                self.groups_by_member.insert(local_id, group.clone());
                self.spawn_req(group.clone());
                group.relay_sub_id.clone()
            }
            Some(delay) => loop {
                let fingerprint = filter_fingerprint(&filters);
                if let Some(entry) = self.pending_by_fingerprint.get(&fingerprint) {
                    let group = entry.clone();
                    drop(entry);
                    if group.try_join(member.clone()) {
                        self.groups_by_member.insert(local_id, group.clone());
                        debug!(
                            relay = %self.url,
                            relay_sub_id = %group.relay_sub_id,
                            "joined pending subscription group"
                        );
                        return group.relay_sub_id.clone();
                    }
                    // Window closed between lookup and join
                    self.pending_by_fingerprint
                        .remove_if(&fingerprint, |_, g| Arc::ptr_eq(g, &group));
                    continue;
                }

                let group = Arc::new(RelayGroup::new(
                    Some(fingerprint.clone()),
                    filters.clone(),
                    true,
                ));
                group.members.write().push(member.clone());
                self.groups_by_sub
                    .insert(group.relay_sub_id.clone(), group.clone());
                self.groups_by_member.insert(local_id, group.clone());
                self.pending_by_fingerprint
                    .insert(fingerprint, group.clone());
                self.spawn_delayed_req(group.clone(), delay);
                return group.relay_sub_id.clone();
            },
        }
    }

    /// End a logical subscription's stream. Safe to call for subscriptions
    /// that were never subscribed here. The relay-side REQ is closed when its
    /// last member leaves.
    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) {
        let Some((_, group)) = self.groups_by_member.remove(subscription_id) else {
            return;
        };

        let now_empty = {
            let mut members = group.members.write();
            members.retain(|member| member.subscription_id != *subscription_id);
            members.is_empty()
        };
        if !now_empty {
            return;
        }

        group.joinable.store(false, Ordering::SeqCst);
        if let Some(fingerprint) = &group.fingerprint {
            self.pending_by_fingerprint
                .remove_if(fingerprint, |_, g| Arc::ptr_eq(g, &group));
        }
        self.groups_by_sub.remove(&group.relay_sub_id);

        if group.sent.load(Ordering::SeqCst) {
            let transport = self.transport.clone();
            let url = self.url.clone();
            let relay_sub_id = group.relay_sub_id.clone();
            self.tracker.spawn(async move {
                if let Err(e) = transport.send_close(&url, &relay_sub_id).await {
                    debug!(relay = %url, error = %e, "failed to close relay subscription");
                }
            });
        }
    }

    /// Deliver an inbound event to every member of the relay-side
    /// subscription it arrived on
    pub async fn dispatch_event(self: &Arc<Self>, relay_sub_id: &SubscriptionId, event: Event) {
        let Some(group) = self.groups_by_sub.get(relay_sub_id).map(|g| g.clone()) else {
            debug!(
                relay = %self.url,
                relay_sub_id = %relay_sub_id,
                "event for unknown relay subscription dropped"
            );
            return;
        };

        for sender in group.member_senders() {
            let message = CoordinatorMessage::RelayEvent {
                relay: Arc::clone(self),
                event: Box::new(event.clone()),
            };
            if sender.send_async(message).await.is_err() {
                debug!(relay = %self.url, "subscription channel closed, event dropped");
            }
        }
    }

    /// Deliver an inbound EOSE notice to every member
    pub async fn dispatch_eose(self: &Arc<Self>, relay_sub_id: &SubscriptionId) {
        let Some(group) = self.groups_by_sub.get(relay_sub_id).map(|g| g.clone()) else {
            debug!(
                relay = %self.url,
                relay_sub_id = %relay_sub_id,
                "EOSE for unknown relay subscription dropped"
            );
            return;
        };

        for sender in group.member_senders() {
            let message = CoordinatorMessage::RelayEose {
                relay: Arc::clone(self),
            };
            if sender.send_async(message).await.is_err() {
                debug!(relay = %self.url, "subscription channel closed, EOSE dropped");
            }
        }
    }

    fn spawn_req(&self, group: Arc<RelayGroup>) {
        group.sent.store(true, Ordering::SeqCst);
        let transport = self.transport.clone();
        let url = self.url.clone();
        self.tracker.spawn(async move {
            if let Err(e) = transport
                .send_req(&url, &group.relay_sub_id, &group.filters)
                .await
            {
                warn!(relay = %url, error = %e, "failed to send REQ");
            }
        });
    }

    fn spawn_delayed_req(self: &Arc<Self>, group: Arc<RelayGroup>, delay: Duration) {
        let handle = Arc::clone(self);
        let token = self.cancellation_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }

            // Close the join window before deciding the group's fate
            let empty = {
                let members = group.members.write();
                group.joinable.store(false, Ordering::SeqCst);
                members.is_empty()
            };
            if let Some(fingerprint) = &group.fingerprint {
                handle
                    .pending_by_fingerprint
                    .remove_if(fingerprint, |_, g| Arc::ptr_eq(g, &group));
            }
            if empty {
                handle.groups_by_sub.remove(&group.relay_sub_id);
                return;
            }

            group.sent.store(true, Ordering::SeqCst);
            if let Err(e) = handle
                .transport
                .send_req(&handle.url, &group.relay_sub_id, &group.filters)
                .await
            {
                warn!(relay = %handle.url, error = %e, "failed to send REQ");
            }
        });
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("url", &self.url)
            .field("status", &self.status())
            .field("sampler", &self.sampler)
            .field("groups", &self.groups_by_sub.len())
            .finish()
    }
}

/// Canonical identity of a filter list, used to coalesce identical REQs
fn filter_fingerprint(filters: &[Filter]) -> String {
    serde_json::to_string(filters).unwrap_or_else(|_| format!("{filters:?}"))
}
