//! Intra-device broadcaster.
//!
//! Contexts on the same device (tabs, windows, workers) share one local
//! store. When one of them stores new records it publishes them here so the
//! others can apply them without waiting for a sync round trip.
//!
//! # Usage
//!
//! ```rust,ignore
//! let hub = BroadcastHub::new();
//! let tab_a = hub.channel("vaultsync-changes", "tab-a");
//! let tab_b = hub.channel("vaultsync-changes", "tab-b");
//!
//! let _sub = tab_b.subscribe(|msg| println!("{} change(s)", msg.records().len()))?;
//! tab_a.publish(&[ChangeRecord::new("c1", "x")]);
//! ```
//!
//! Delivery is fire-and-forget: every subscription owns an unbounded queue
//! drained by its own thread, so a slow listener never blocks a publisher.
//! Nothing is persisted; a context that is not subscribed misses the message.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use vaultsync_protocol::{BroadcastMessage, ChangeRecord};

struct Slot {
    id: u64,
    context_id: String,
    sender: Sender<BroadcastMessage>,
}

struct ChannelShared {
    name: String,
    slots: RwLock<Vec<Slot>>,
}

impl ChannelShared {
    fn remove(&self, id: u64) {
        self.slots.write().retain(|slot| slot.id != id);
    }
}

struct HubInner {
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
    next_id: AtomicU64,
}

/// Registry of named broadcast channels.
///
/// Cloning a hub yields a handle to the same registry. Channels with the
/// same name obtained from the same hub talk to each other.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Opens the channel `name` on behalf of the context `context_id`.
    pub fn channel(&self, name: &str, context_id: impl Into<String>) -> BroadcastChannel {
        let shared = {
            let mut channels = self.inner.channels.lock();
            Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
                Arc::new(ChannelShared {
                    name: name.to_string(),
                    slots: RwLock::new(Vec::new()),
                })
            }))
        };
        BroadcastChannel {
            hub: Arc::clone(&self.inner),
            shared,
            context_id: context_id.into(),
        }
    }

    /// Returns the names of all channels opened so far, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("channels", &self.channel_names())
            .finish()
    }
}

/// One context's handle on a named channel.
#[derive(Clone)]
pub struct BroadcastChannel {
    hub: Arc<HubInner>,
    shared: Arc<ChannelShared>,
    context_id: String,
}

impl BroadcastChannel {
    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the id of the context that owns this handle.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Returns the number of live subscriptions on this channel, across all
    /// contexts.
    pub fn subscriber_count(&self) -> usize {
        self.shared.slots.read().len()
    }

    /// Publishes `records` as one message to every other context.
    ///
    /// Subscriptions of the publishing context are skipped. Returns the
    /// number of subscriptions the message was queued for. An empty batch
    /// is not published.
    pub fn publish(&self, records: &[ChangeRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let message = BroadcastMessage::changes(records.to_vec());

        let mut delivered = 0;
        let mut slots = self.shared.slots.write();
        slots.retain(|slot| {
            if slot.context_id == self.context_id {
                return true;
            }
            // A send only fails once the receiving side is gone.
            let alive = slot.sender.send(message.clone()).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        drop(slots);

        tracing::debug!(
            channel = %self.shared.name,
            context = %self.context_id,
            records = records.len(),
            delivered,
            "published changes"
        );
        delivered
    }

    /// Registers `listener`, called once per message published by another
    /// context until the returned [`Subscription`] is dropped.
    ///
    /// The listener runs on a dedicated thread, in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery thread cannot be spawned.
    pub fn subscribe<F>(&self, mut listener: F) -> io::Result<Subscription>
    where
        F: FnMut(&BroadcastMessage) + Send + 'static,
    {
        let (id, receiver) = self.register();
        let active = Arc::new(AtomicBool::new(true));
        let worker_active = Arc::clone(&active);

        let spawned = thread::Builder::new()
            .name(format!("vaultsync-broadcast-{}", self.shared.name))
            .spawn(move || {
                for message in receiver {
                    if !worker_active.load(Ordering::SeqCst) {
                        break;
                    }
                    listener(&message);
                }
            });
        if let Err(e) = spawned {
            self.shared.remove(id);
            return Err(e);
        }

        Ok(Subscription {
            shared: Arc::clone(&self.shared),
            id,
            active,
        })
    }

    /// Registers a poll-style subscription.
    ///
    /// The slot is released on the first publish after the receiver is
    /// dropped.
    pub fn subscribe_receiver(&self) -> Receiver<BroadcastMessage> {
        self.register().1
    }

    fn register(&self) -> (u64, Receiver<BroadcastMessage>) {
        let (sender, receiver) = mpsc::channel();
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.slots.write().push(Slot {
            id,
            context_id: self.context_id.clone(),
            sender,
        });
        (id, receiver)
    }
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.shared.name)
            .field("context_id", &self.context_id)
            .finish()
    }
}

/// A live listener registration.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) stops
/// delivery; messages still queued are discarded.
#[must_use = "dropping a subscription stops delivery"]
pub struct Subscription {
    shared: Arc<ChannelShared>,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Ends the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Returns true until the subscription is ended.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.shared.remove(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.shared.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn records(ids: &[&str]) -> Vec<ChangeRecord> {
        ids.iter().map(|id| ChangeRecord::new(*id, "x")).collect()
    }

    #[test]
    fn publish_reaches_other_contexts_only() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let b = hub.channel("changes", "b");

        let from_a = a.subscribe_receiver();
        let from_b = b.subscribe_receiver();

        assert_eq!(a.publish(&records(&["c1"])), 1);

        let msg = from_b.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.records(), records(&["c1"]).as_slice());
        assert!(from_a.try_recv().is_err());
    }

    #[test]
    fn channels_are_isolated_by_name() {
        let hub = BroadcastHub::new();
        let a = hub.channel("one", "a");
        let b = hub.channel("two", "b");
        let rx = b.subscribe_receiver();

        assert_eq!(a.publish(&records(&["c1"])), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.channel_names(), ["one", "two"]);
    }

    #[test]
    fn separate_hubs_do_not_share_channels() {
        let a = BroadcastHub::new().channel("changes", "a");
        let b = BroadcastHub::new().channel("changes", "b");
        let _rx = b.subscribe_receiver();
        assert_eq!(a.publish(&records(&["c1"])), 0);
    }

    #[test]
    fn empty_batch_is_not_published() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let rx = hub.channel("changes", "b").subscribe_receiver();
        assert_eq!(a.publish(&[]), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn listener_sees_messages_in_publish_order() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let b = hub.channel("changes", "b");

        let (tx, rx) = mpsc::channel();
        let _sub = b
            .subscribe(move |msg| {
                let ids: Vec<String> = msg.records().iter().map(|r| r.id().to_string()).collect();
                tx.send(ids).unwrap();
            })
            .unwrap();

        a.publish(&records(&["c1", "c2"]));
        a.publish(&records(&["c3"]));

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ["c1", "c2"]);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ["c3"]);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let b = hub.channel("changes", "b");

        let sub = b.subscribe(|_| {}).unwrap();
        assert!(sub.is_active());
        assert_eq!(b.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(a.publish(&records(&["c1"])), 0);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let b = hub.channel("changes", "b");

        drop(b.subscribe_receiver());
        assert_eq!(a.subscriber_count(), 1);
        assert_eq!(a.publish(&records(&["c1"])), 0);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn wire_form_is_json() {
        let hub = BroadcastHub::new();
        let a = hub.channel("changes", "a");
        let rx = hub.channel("changes", "b").subscribe_receiver();
        a.publish(&records(&["c1"]));

        let json = rx.recv_timeout(WAIT).unwrap().to_json().unwrap();
        assert_eq!(json, r#"{"type":"changes","changes":[{"id":"c1","data":"x"}]}"#);
    }
}
