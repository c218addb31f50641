//! Per-user JMAP Session cache
//!
//! Entries are keyed by username and hold either a loaded Session or the
//! error the loader failed with, each with its own time-to-live. Concurrent
//! lookups of the same username share one loader call. Expiry is measured
//! from insertion; hits never extend it.
//!
//! Entry lifecycle: absent, then loading, then succeeded or failed. Entries
//! leave the cache on expiry, capacity eviction or (succeeded only) when the
//! JMAP client reports the session as outdated. Only an absent entry starts a
//! new load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::jmap::{JmapClient, JmapError, JmapResult, Session, SessionEventListener};
use crate::metrics::{Metrics, cache_event};

/// Sizing and expiry of the cache
#[derive(Debug, Clone, Copy)]
pub struct SessionCacheSettings {
    pub max_capacity: usize,
    pub ttl: Duration,
    pub failure_ttl: Duration,
}

#[derive(Debug, Clone)]
enum CachedSession {
    Succeeded { session: Arc<Session>, since: Instant },
    Failed { error: JmapError, since: Instant },
}

impl CachedSession {
    fn since(&self) -> Instant {
        match self {
            Self::Succeeded { since, .. } | Self::Failed { since, .. } => *since,
        }
    }

    fn result(&self) -> JmapResult<Arc<Session>> {
        match self {
            Self::Succeeded { session, .. } => Ok(Arc::clone(session)),
            Self::Failed { error, .. } => Err(error.clone()),
        }
    }
}

type Slot = Arc<OnceCell<CachedSession>>;

/// Session cache with single-flight loading
pub struct SessionCache {
    client: Arc<JmapClient>,
    settings: SessionCacheSettings,
    slots: Mutex<HashMap<String, Slot>>,
    metrics: Arc<Metrics>,
}

impl SessionCache {
    pub fn new(client: Arc<JmapClient>, settings: SessionCacheSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            settings,
            slots: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn ttl_of(&self, entry: &CachedSession) -> Duration {
        match entry {
            CachedSession::Succeeded { .. } => self.settings.ttl,
            CachedSession::Failed { .. } => self.settings.failure_ttl,
        }
    }

    fn is_expired(&self, entry: &CachedSession, now: Instant) -> bool {
        now.saturating_duration_since(entry.since()) >= self.ttl_of(entry)
    }

    fn evicted(&self, username: &str, entry: &CachedSession, reason: &str, now: Instant) {
        self.metrics.session_cache_event(cache_event::EVICTION);
        trace!(
            username,
            reason,
            spent_ms = now.saturating_duration_since(entry.since()).as_millis() as u64,
            failed = matches!(entry, CachedSession::Failed { .. }),
            "session cache eviction"
        );
    }

    /// Session of `username`, loading it on a miss
    ///
    /// # Errors
    ///
    /// The loader error, possibly a cached one that is still within the
    /// failure time-to-live.
    pub async fn get(&self, username: &str) -> JmapResult<Arc<Session>> {
        let slot = self.slot(username);
        let entry = slot
            .get_or_init(|| async {
                let result = self.client.fetch_session(username).await;
                self.metrics.session_cache_event(cache_event::INSERTION);
                let since = Instant::now();
                match result {
                    Ok(session) => CachedSession::Succeeded {
                        session: Arc::new(session),
                        since,
                    },
                    Err(error) => {
                        debug!(username, kind = %error.kind, "caching failed session lookup");
                        CachedSession::Failed { error, since }
                    }
                }
            })
            .await;
        entry.result()
    }

    /// Existing live slot of `username`, or a fresh one
    fn slot(&self, username: &str) -> Slot {
        let now = Instant::now();
        let Ok(mut slots) = self.slots.lock() else {
            // A poisoned map is bypassed: the lookup loads without caching.
            return Arc::new(OnceCell::new());
        };
        if let Some(slot) = slots.get(username) {
            match slot.get() {
                Some(entry) if self.is_expired(entry, now) => {
                    self.evicted(username, entry, "expired", now);
                    slots.remove(username);
                }
                Some(_) => {
                    self.metrics.session_cache_event(cache_event::HIT);
                    return Arc::clone(slot);
                }
                // In flight: join the running load.
                None => return Arc::clone(slot),
            }
        }
        self.metrics.session_cache_event(cache_event::MISS);
        if slots.len() >= self.settings.max_capacity {
            self.make_room(&mut slots, now);
        }
        let slot: Slot = Arc::new(OnceCell::new());
        slots.insert(username.to_owned(), Arc::clone(&slot));
        slot
    }

    /// Drop expired entries, then the oldest ones, until one slot is free
    fn make_room(&self, slots: &mut HashMap<String, Slot>, now: Instant) {
        let expired: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|e| self.is_expired(e, now)))
            .map(|(username, _)| username.clone())
            .collect();
        for username in expired {
            if let Some(slot) = slots.remove(&username)
                && let Some(entry) = slot.get()
            {
                self.evicted(&username, entry, "expired", now);
            }
        }
        while slots.len() >= self.settings.max_capacity.max(1) {
            let oldest = slots
                .iter()
                .filter_map(|(username, slot)| slot.get().map(|e| (username.clone(), e.since())))
                .min_by_key(|(_, since)| *since)
                .map(|(username, _)| username);
            let Some(username) = oldest else {
                // Only loads in flight remain.
                break;
            };
            if let Some(slot) = slots.remove(&username)
                && let Some(entry) = slot.get()
            {
                self.evicted(&username, entry, "capacity", now);
            }
        }
    }

    /// Remove every expired entry
    pub fn cleanup(&self) {
        let now = Instant::now();
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        slots.retain(|username, slot| match slot.get() {
            Some(entry) if self.is_expired(entry, now) => {
                self.evicted(username, entry, "expired", now);
                false
            }
            _ => true,
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }

    /// Run [`Self::cleanup`] every `interval` until `shutdown` is cancelled
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.cleanup(),
                }
            }
            debug!("session cache cleanup stopped");
        })
    }
}

impl SessionEventListener for SessionCache {
    fn on_session_outdated(&self, session: &Session, new_state: &str) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let outdated = slots.get(&session.username).is_some_and(|slot| {
            matches!(slot.get(), Some(CachedSession::Succeeded { session: cached, .. }) if cached.state == session.state)
        });
        if outdated {
            slots.remove(&session.username);
            self.metrics.session_cache_event(cache_event::OUTDATED);
            debug!(
                username = %session.username,
                old = %session.state,
                new = %new_state,
                "session outdated, removed from cache"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::jmap::JmapErrorKind;
    use crate::jmap::tests::FakeTransport;

    fn cache(fake: &Arc<FakeTransport>, settings: SessionCacheSettings) -> (Arc<JmapClient>, Arc<SessionCache>, Arc<Metrics>) {
        let client = Arc::new(JmapClient::new(fake.clone()));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let cache = Arc::new(SessionCache::new(client.clone(), settings, metrics.clone()));
        (client, cache, metrics)
    }

    fn settings() -> SessionCacheSettings {
        SessionCacheSettings {
            max_capacity: 10,
            ttl: Duration::from_secs(60),
            failure_ttl: Duration::from_millis(30),
        }
    }

    fn count(metrics: &Metrics, event: &str) -> u64 {
        metrics.session_cache.with_label_values(&[event]).get()
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_load() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let (_, cache, metrics) = cache(&fake, settings());
        let (a, b) = tokio::join!(cache.get("alice"), cache.get("alice"));
        let c = cache.get("alice").await.expect("session");
        assert_eq!(a.expect("session"), b.expect("session"));
        assert_eq!(c.state, "s0");
        assert_eq!(fake.session_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(count(&metrics, cache_event::INSERTION), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_for_the_failure_ttl() {
        let fake = Arc::new(FakeTransport::default());
        let (_, cache, _) = cache(&fake, settings());
        let err = cache.get("bob").await.expect_err("unknown user");
        assert_eq!(err.kind, JmapErrorKind::AuthenticationFailed);
        cache.get("bob").await.expect_err("still failing");
        assert_eq!(fake.session_fetches.load(Ordering::SeqCst), 1);

        fake.add_session("bob", "s9");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let session = cache.get("bob").await.expect("retried after failure ttl");
        assert_eq!(session.state, "s9");
        assert_eq!(fake.session_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capacity_evictions_are_counted() {
        let fake = Arc::new(FakeTransport::default());
        for user in ["u1", "u2", "u3"] {
            fake.add_session(user, "s0");
        }
        let (_, cache, metrics) = cache(
            &fake,
            SessionCacheSettings {
                max_capacity: 2,
                ..settings()
            },
        );
        for user in ["u1", "u2", "u3"] {
            cache.get(user).await.expect("session");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(count(&metrics, cache_event::EVICTION), 1);
        cache.get("u1").await.expect("reloaded");
        assert_eq!(fake.session_fetches.load(Ordering::SeqCst), 4);
        assert_eq!(count(&metrics, cache_event::EVICTION), 2);
    }

    #[tokio::test]
    async fn outdated_sessions_are_reloaded() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let (client, cache, metrics) = cache(&fake, settings());
        let weak: Weak<dyn SessionEventListener> =
            Arc::downgrade(&(cache.clone() as Arc<dyn SessionEventListener>));
        client.add_session_event_listener(weak);

        let session = cache.get("alice").await.expect("session");
        fake.respond("s1", json!([["Mailbox/get", {"state": "m", "list": []}, "0"]]));
        client
            .get_mailboxes(&session, None, "a1", None)
            .await
            .expect("mailboxes");
        assert_eq!(count(&metrics, cache_event::OUTDATED), 1);
        assert_eq!(cache.len(), 0);

        fake.add_session("alice", "s1");
        assert_eq!(cache.get("alice").await.expect("session").state, "s1");
        assert_eq!(fake.session_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_entries() {
        let fake = Arc::new(FakeTransport::default());
        let (_, cache, metrics) = cache(&fake, settings());
        cache.get("ghost").await.expect_err("unknown");
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.cleanup();
        assert_eq!(cache.len(), 0);
        assert_eq!(count(&metrics, cache_event::EVICTION), 1);
    }
}
