//! Hub registry: lifecycle, shard routing, and publishing
//!
//! The registry is the explicit root object of the hub cluster. It builds the
//! fixed set of shards at startup, routes every user to exactly one shard via
//! a stable hash, exposes the register/unregister/invalidate entry points for
//! the transport and store layers, and fans published events out to every
//! shard. There is no global singleton: collaborators hold a reference to the
//! registry they were given.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{HubError, Result};
use crate::event::Event;
use crate::hub::interfaces::{
    SharedAuthorizer, SharedClusterGateway, SharedMetricsSink, SharedPresenceListener,
};
use crate::hub::shard::{shard_pair, ShardHandle};
use crate::hub::supervisor::spawn_supervised;
use crate::hub::watchdog;
use crate::HubConfig;

/// FNV-1a 32-bit hash, the shard router's distribution function.
///
/// Stable for the process lifetime (and, being keyless, across runs), so a
/// user's connections always land on the same shard.
fn fnv1a32(input: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Builder for a [`HubRegistry`]
pub struct HubBuilder {
    config: HubConfig,
    authorizer: Option<SharedAuthorizer>,
    presence: Option<SharedPresenceListener>,
    cluster: Option<SharedClusterGateway>,
    metrics: Option<SharedMetricsSink>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            authorizer: None,
            presence: None,
            cluster: None,
            metrics: None,
        }
    }

    /// Authorization predicate deciding event visibility (required)
    pub fn with_authorizer(mut self, authorizer: SharedAuthorizer) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Presence listener receiving user-offline transitions (optional)
    pub fn with_presence(mut self, presence: SharedPresenceListener) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Cluster gateway for multi-node replication (optional)
    pub fn with_cluster(mut self, cluster: SharedClusterGateway) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Metrics sink counting published events (optional)
    pub fn with_metrics(mut self, metrics: SharedMetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the hub: spawn every shard under its supervisor plus the
    /// watchdog.
    ///
    /// Fails fast on a zero shard count or a missing authorizer; both are
    /// startup configuration errors, not runtime conditions.
    pub fn build(self) -> Result<HubRegistry> {
        if self.config.shard_count == 0 {
            return Err(HubError::config("hub shard count must be at least 1"));
        }
        let authorizer = self
            .authorizer
            .ok_or_else(|| HubError::config("hub requires an authorizer"))?;

        info!("hub starting with {} shards", self.config.shard_count);

        let total_connections = Arc::new(AtomicI64::new(0));
        let mut shards = Vec::with_capacity(self.config.shard_count);
        let mut supervisors = Vec::with_capacity(self.config.shard_count);

        for index in 0..self.config.shard_count {
            let (handle, state) = shard_pair(
                index,
                &self.config,
                Arc::clone(&authorizer),
                self.presence.clone(),
                Arc::clone(&total_connections),
            );
            supervisors.push(spawn_supervised(state, Arc::clone(&handle.generation)));
            shards.push(handle);
        }

        let watchdog_token = CancellationToken::new();
        let watchdog_task = watchdog::spawn(
            shards.clone(),
            self.config.watchdog_interval,
            self.config.broadcast_high_water(),
            watchdog_token.clone(),
        );

        Ok(HubRegistry {
            shards,
            supervisors,
            watchdog_task: Some(watchdog_task),
            watchdog_token,
            total_connections,
            cluster: self.cluster,
            metrics: self.metrics,
        })
    }
}

/// The running hub cluster
pub struct HubRegistry {
    shards: Vec<ShardHandle>,
    supervisors: Vec<JoinHandle<()>>,
    watchdog_task: Option<JoinHandle<()>>,
    watchdog_token: CancellationToken,
    total_connections: Arc<AtomicI64>,
    cluster: Option<SharedClusterGateway>,
    metrics: Option<SharedMetricsSink>,
}

impl HubRegistry {
    /// Number of shards, fixed for the registry's lifetime
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Which shard owns a user's connections.
    ///
    /// Deterministic: the same user id always maps to the same shard within
    /// one registry.
    pub fn shard_for(&self, user_id: &str) -> usize {
        fnv1a32(user_id) as usize % self.shards.len()
    }

    /// Approximate number of registered connections across all shards.
    ///
    /// Maintained atomically by the shard loops; eventually consistent with
    /// the authoritative per-shard lists.
    pub fn total_connections(&self) -> i64 {
        self.total_connections.load(Ordering::SeqCst)
    }

    /// Register a connection with its owning shard.
    ///
    /// Registration is asynchronous: it is visible in [`total_connections`]
    /// once the shard has processed the message. If the connection is already
    /// authenticated, the one-time hello greeting is enqueued here, outside
    /// the shard loop. Registering on a stopped shard (or after shutdown) is
    /// silently dropped; the client will reconnect.
    ///
    /// [`total_connections`]: HubRegistry::total_connections
    pub async fn register(&self, connection: Arc<Connection>) {
        let shard = &self.shards[self.shard_for(connection.user_id())];
        let greeter = Arc::clone(&connection);

        if shard.register_tx.send(connection).await.is_err() {
            debug!(
                "register of connection {} dropped, shard {} is stopped",
                greeter.id(),
                shard.index
            );
            return;
        }

        if greeter.is_authenticated() {
            greeter.send_hello();
        }
    }

    /// Unregister a connection from its owning shard.
    ///
    /// Unknown connections are a no-op; the shard still re-checks whether the
    /// user has any remaining connections and emits the offline signal if
    /// not.
    pub async fn unregister(&self, connection: Arc<Connection>) {
        let shard = &self.shards[self.shard_for(connection.user_id())];
        if shard.unregister_tx.send(connection).await.is_err() {
            debug!("unregister dropped, shard {} is stopped", shard.index);
        }
    }

    /// Run the cache-invalidation hook on every live connection of a user
    pub async fn invalidate_user(&self, user_id: &str) {
        let shard = &self.shards[self.shard_for(user_id)];
        if shard
            .invalidate_tx
            .send(user_id.to_string())
            .await
            .is_err()
        {
            debug!("invalidate dropped, shard {} is stopped", shard.index);
        }
    }

    /// Publish an event to every shard and, when configured, to the cluster
    /// gateway.
    ///
    /// Fire-and-forget: delivery is best-effort, at most once per connection.
    /// A shard crash mid-broadcast can lose the event for connections that
    /// shard had not reached yet; it is not retried.
    pub async fn publish(&self, event: Event) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_event(&event.kind);
        }

        let event = Arc::new(event);
        self.fan_out(&event).await;

        if let Some(cluster) = &self.cluster {
            cluster.publish(Arc::clone(&event)).await;
        }
    }

    /// Publish without the cluster hand-off.
    ///
    /// Used for events that arrived from another node's gateway and must not
    /// be replicated back out.
    pub async fn publish_local_only(&self, event: Event) {
        let event = Arc::new(event);
        self.fan_out(&event).await;
    }

    async fn fan_out(&self, event: &Arc<Event>) {
        for shard in &self.shards {
            if shard.broadcast_tx.send(Arc::clone(event)).await.is_err() {
                debug!("broadcast dropped, shard {} is stopped", shard.index);
            }
        }
    }

    /// Stop the watchdog and every shard, then wait for all of them.
    ///
    /// Stopped shards are terminal; a registry cannot be restarted.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("hub shutting down {} shards", self.shards.len());

        self.watchdog_token.cancel();
        if let Some(task) = self.watchdog_task.take() {
            task.await
                .map_err(|err| HubError::internal(format!("watchdog join failed: {}", err)))?;
        }

        for shard in &self.shards {
            let _ = shard.stop_tx.send(()).await;
        }
        for task in self.supervisors.drain(..) {
            task.await
                .map_err(|err| HubError::internal(format!("shard join failed: {}", err)))?;
        }

        Ok(())
    }
}

impl Drop for HubRegistry {
    fn drop(&mut self) {
        // A registry dropped without shutdown() still unwinds: the watchdog
        // exits and releases its channel handles, and the shard loops detach
        // once every sender is gone.
        self.watchdog_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventScope};
    use crate::hub::interfaces::{
        Authorizer, ClusterGateway, MetricsSink, StaticMembership,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct OpenAuthorizer;

    impl Authorizer for OpenAuthorizer {
        fn event_in_scope(&self, _connection: &Connection, _event: &Event) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        published: Mutex<Vec<Arc<Event>>>,
    }

    #[async_trait]
    impl ClusterGateway for RecordingGateway {
        async fn publish(&self, event: Arc<Event>) {
            self.published
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(event);
        }
    }

    #[derive(Default)]
    struct CountingSink {
        events: AtomicUsize,
    }

    impl MetricsSink for CountingSink {
        fn increment_event(&self, _kind: &EventKind) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> HubConfig {
        HubConfig {
            shard_count: 2,
            send_queue_size: 8,
            broadcast_queue_size: 16,
            ..Default::default()
        }
    }

    fn open_registry() -> HubRegistry {
        HubBuilder::new(test_config())
            .with_authorizer(Arc::new(OpenAuthorizer))
            .build()
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            loop {
                if condition() {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn posted(seq: u64) -> Event {
        Event::new(EventKind::Posted, EventScope::All).with_payload(json!({ "seq": seq }))
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
    }

    #[tokio::test]
    async fn test_zero_shards_is_a_startup_error() {
        let config = HubConfig {
            shard_count: 0,
            ..Default::default()
        };
        let result = HubBuilder::new(config)
            .with_authorizer(Arc::new(OpenAuthorizer))
            .build();
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_authorizer_is_a_startup_error() {
        let result = HubBuilder::new(test_config()).build();
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_shard_routing_is_deterministic() {
        let mut registry = open_registry();

        let first = registry.shard_for("U1");
        for _ in 0..100 {
            assert_eq!(registry.shard_for("U1"), first);
        }
        assert!(first < registry.shard_count());

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_user_connections_share_a_shard_and_count() {
        let mut registry = open_registry();

        let (conn_a, _rx_a) = Connection::new("U1".to_string(), 8);
        let (conn_b, _rx_b) = Connection::new("U1".to_string(), 8);
        registry.register(Arc::clone(&conn_a)).await;
        registry.register(Arc::clone(&conn_b)).await;
        wait_until(|| registry.total_connections() == 2).await;

        registry.unregister(conn_a).await;
        registry.unregister(conn_b).await;
        wait_until(|| registry.total_connections() == 0).await;

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_reaches_all_matching_connections_in_order() {
        let mut registry = open_registry();

        // Users on (potentially) different shards.
        let (conn_a, mut rx_a) = Connection::new("U1".to_string(), 8);
        let (conn_b, mut rx_b) = Connection::new("U2".to_string(), 8);
        registry.register(conn_a).await;
        registry.register(conn_b).await;
        wait_until(|| registry.total_connections() == 2).await;

        for seq in 0..3u64 {
            registry.publish(posted(seq)).await;
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in 0..3u64 {
                let event = timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(event.payload["seq"], expected);
            }
        }

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_scope_respects_membership() {
        let membership = Arc::new(StaticMembership::new());
        membership.join_channel("U1", "town-square");

        let mut registry = HubBuilder::new(test_config())
            .with_authorizer(membership)
            .build()
            .unwrap();

        let (conn_a, mut rx_a) = Connection::new("U1".to_string(), 8);
        let (conn_b, mut rx_b) = Connection::new("U2".to_string(), 8);
        conn_a.set_authenticated(true);
        conn_b.set_authenticated(true);
        registry.register(conn_a).await;
        registry.register(conn_b).await;
        wait_until(|| registry.total_connections() == 2).await;

        // Both connections were greeted on registration.
        assert_eq!(rx_a.recv().await.unwrap().kind, EventKind::Hello);
        assert_eq!(rx_b.recv().await.unwrap().kind, EventKind::Hello);

        let channel_event = Event::new(
            EventKind::Posted,
            EventScope::Channel("town-square".to_string()),
        );
        registry.publish(channel_event).await;
        registry
            .publish(Event::new(EventKind::StatusChange, EventScope::All))
            .await;

        // U1 sees the channel event, then the broadcast.
        assert_eq!(rx_a.recv().await.unwrap().kind, EventKind::Posted);
        assert_eq!(rx_a.recv().await.unwrap().kind, EventKind::StatusChange);

        // U2 is not a member: its next event is the broadcast.
        assert_eq!(rx_b.recv().await.unwrap().kind, EventKind::StatusChange);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted_sibling_keeps_receiving() {
        let mut registry = open_registry();

        // conn_a holds one event and is never drained; conn_b is healthy.
        let (conn_a, _rx_a) = Connection::new("U1".to_string(), 1);
        let (conn_b, mut rx_b) = Connection::new("U1".to_string(), 8);
        registry.register(Arc::clone(&conn_a)).await;
        registry.register(conn_b).await;
        wait_until(|| registry.total_connections() == 2).await;

        registry.publish(posted(0)).await;
        registry.publish(posted(1)).await;

        wait_until(|| registry.total_connections() == 1).await;
        assert!(conn_a.is_closed());

        for expected in 0..2u64 {
            let event = timeout(Duration::from_secs(1), rx_b.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.payload["seq"], expected);
        }

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_user_hits_only_that_user() {
        let mut registry = open_registry();

        let (conn_a, _rx_a) = Connection::new("U1".to_string(), 8);
        let (conn_b, _rx_b) = Connection::new("U2".to_string(), 8);
        registry.register(Arc::clone(&conn_a)).await;
        registry.register(Arc::clone(&conn_b)).await;
        wait_until(|| registry.total_connections() == 2).await;

        registry.invalidate_user("U1").await;
        wait_until(|| conn_a.last_invalidated() > 0).await;
        assert_eq!(conn_b.last_invalidated(), 0);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_count_published_events() {
        let sink = Arc::new(CountingSink::default());
        let mut registry = HubBuilder::new(test_config())
            .with_authorizer(Arc::new(OpenAuthorizer))
            .with_metrics(Arc::clone(&sink) as _)
            .build()
            .unwrap();

        registry.publish(posted(0)).await;
        registry.publish(posted(1)).await;
        assert_eq!(sink.events.load(Ordering::SeqCst), 2);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_gateway_skipped_for_local_only() {
        let gateway = Arc::new(RecordingGateway::default());
        let mut registry = HubBuilder::new(test_config())
            .with_authorizer(Arc::new(OpenAuthorizer))
            .with_cluster(Arc::clone(&gateway) as _)
            .build()
            .unwrap();

        registry.publish(posted(0)).await;
        registry.publish_local_only(posted(1)).await;

        let published = gateway
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload["seq"], 0);
        drop(published);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_after_shutdown_is_silently_dropped() {
        let mut registry = open_registry();
        registry.shutdown().await.unwrap();

        let (conn, _rx) = Connection::new("U1".to_string(), 8);
        registry.register(conn).await;
        registry.publish(posted(0)).await;

        assert_eq!(registry.total_connections(), 0);
    }
}
