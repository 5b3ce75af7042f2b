use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::time::sleep;
use tower_locator::{
    CacheConfig, CacheLookup, Endpoint, RegistryCache, RegistryClient, RegistryError,
    StalenessPolicy,
};

fn ep(host: &str) -> Endpoint {
    Endpoint::new(host, 8080)
}

/// Registry backed by a shared endpoint list that tests mutate mid-run.
struct LiveRegistry {
    endpoints: Arc<std::sync::Mutex<Vec<Endpoint>>>,
    down: Arc<AtomicBool>,
    empty_answers: Arc<AtomicUsize>,
}

impl RegistryClient for LiveRegistry {
    async fn fetch_instances(&self, _: &str) -> Result<Vec<Endpoint>, RegistryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("connection refused".into()));
        }
        let endpoints = self.endpoints.lock().unwrap().clone();
        if endpoints.is_empty() {
            self.empty_answers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(endpoints)
    }

    async fn register(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn heartbeat(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn deregister(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
        Ok(())
    }
}

struct Harness {
    cache: Arc<RegistryCache<LiveRegistry>>,
    endpoints: Arc<std::sync::Mutex<Vec<Endpoint>>>,
    down: Arc<AtomicBool>,
    empty_answers: Arc<AtomicUsize>,
}

fn harness(initial: Vec<Endpoint>, config: CacheConfig) -> Harness {
    let endpoints = Arc::new(std::sync::Mutex::new(initial));
    let down = Arc::new(AtomicBool::new(false));
    let empty_answers = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(RegistryCache::new(
        LiveRegistry {
            endpoints: Arc::clone(&endpoints),
            down: Arc::clone(&down),
            empty_answers: Arc::clone(&empty_answers),
        },
        config,
    ));
    Harness {
        cache,
        endpoints,
        down,
        empty_answers,
    }
}

async fn wait_until<F>(deadline: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let started = std::time::Instant::now();
    while !check() {
        if started.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// A removed instance keeps resolving until the registry has reported it
/// gone for the configured number of consecutive refreshes.
#[tokio::test]
async fn removed_instance_survives_the_detection_delay() {
    let h = harness(
        vec![ep("a")],
        CacheConfig::builder()
            .refresh_interval(Duration::from_millis(20))
            .evict_after_consecutive_empty(3)
            .entry_ttl(Duration::from_secs(60))
            .build(),
    );

    assert!(h.cache.get("user-service").await.is_hit());
    h.cache.start().await;

    // Instance disappears from the registry.
    h.endpoints.lock().unwrap().clear();

    // The entry keeps serving until eviction, then turns into a miss.
    let mut lookups = Vec::new();
    let started = std::time::Instant::now();
    loop {
        let lookup = h.cache.get("user-service").await;
        let hit = lookup.is_hit();
        lookups.push(lookup);
        if !hit {
            break;
        }
        if started.elapsed() > Duration::from_secs(5) {
            panic!("entry was never evicted");
        }
        sleep(Duration::from_millis(5)).await;
    }

    // Eviction required at least the configured streak of empty answers.
    assert!(
        h.empty_answers.load(Ordering::SeqCst) >= 3,
        "evicted after only {} empty answers",
        h.empty_answers.load(Ordering::SeqCst)
    );
    assert_eq!(lookups.last(), Some(&CacheLookup::Miss));

    h.cache.stop().await;
}

/// Readers racing the background refresh see either the old or the new
/// endpoint set, never a mixture.
#[tokio::test]
async fn refresh_replaces_the_entry_atomically() {
    let old_set = vec![ep("old-1"), ep("old-2")];
    let new_set = vec![ep("new-1"), ep("new-2")];

    let h = harness(
        old_set.clone(),
        CacheConfig::builder()
            .refresh_interval(Duration::from_millis(10))
            .entry_ttl(Duration::from_secs(60))
            .build(),
    );

    assert!(h.cache.get("user-service").await.is_hit());
    h.cache.start().await;

    let old: HashSet<Endpoint> = old_set.into_iter().collect();
    let new: HashSet<Endpoint> = new_set.clone().into_iter().collect();

    let reader = {
        let cache = Arc::clone(&h.cache);
        tokio::spawn(async move {
            for _ in 0..100 {
                if let CacheLookup::Hit { endpoints, .. } = cache.get("user-service").await {
                    let seen: HashSet<Endpoint> = endpoints.into_iter().collect();
                    assert!(
                        seen == old || seen == new,
                        "observed a partial endpoint set: {seen:?}"
                    );
                }
                sleep(Duration::from_millis(2)).await;
            }
        })
    };

    sleep(Duration::from_millis(30)).await;
    *h.endpoints.lock().unwrap() = new_set;

    reader.await.unwrap();
    h.cache.stop().await;
}

/// A stale entry whose synchronous re-fetch fails is served anyway.
#[tokio::test]
async fn unreachable_registry_serves_stale() {
    let h = harness(
        vec![ep("a")],
        CacheConfig::builder()
            .entry_ttl(Duration::from_millis(20))
            .staleness_policy(StalenessPolicy::RefreshBeforeServe)
            .build(),
    );

    assert!(h.cache.get("user-service").await.is_hit());

    h.down.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(40)).await;

    match h.cache.get("user-service").await {
        CacheLookup::Hit { endpoints, stale } => {
            assert_eq!(endpoints, vec![ep("a")]);
            assert!(stale);
        }
        other => panic!("expected a stale hit, got {other:?}"),
    }
}

/// Under the serve-flagged policy a stale entry comes back immediately with
/// the stale marker, without a synchronous re-fetch.
#[tokio::test]
async fn serve_flagged_marks_stale_entries() {
    let h = harness(
        vec![ep("a")],
        CacheConfig::builder()
            .entry_ttl(Duration::from_millis(20))
            .staleness_policy(StalenessPolicy::ServeFlagged)
            .build(),
    );

    assert!(h.cache.get("user-service").await.is_hit());
    sleep(Duration::from_millis(40)).await;

    // Even with a healthy registry the entry is served as-is.
    match h.cache.get("user-service").await {
        CacheLookup::Hit { stale, .. } => assert!(stale),
        other => panic!("expected a stale hit, got {other:?}"),
    }
}

/// Instances that reappear before the eviction streak completes are kept.
#[tokio::test]
async fn reappearing_instance_cancels_eviction() {
    let h = harness(
        vec![ep("a")],
        CacheConfig::builder()
            .refresh_interval(Duration::from_millis(20))
            .evict_after_consecutive_empty(5)
            .entry_ttl(Duration::from_secs(60))
            .build(),
    );

    assert!(h.cache.get("user-service").await.is_hit());
    h.cache.start().await;

    h.endpoints.lock().unwrap().clear();
    wait_until(Duration::from_secs(5), || {
        h.empty_answers.load(Ordering::SeqCst) >= 2
    })
    .await;

    // The instance comes back before the streak of five completes.
    *h.endpoints.lock().unwrap() = vec![ep("a")];
    sleep(Duration::from_millis(60)).await;

    assert!(h.cache.get("user-service").await.is_hit());
    h.cache.stop().await;
}
