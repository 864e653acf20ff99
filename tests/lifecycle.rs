//! End-to-end lifecycle scenarios for the session core, driven against a
//! mock container runtime under a paused clock.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ctfpool::docker::{ContainerRuntime, ContainerSpec};
use ctfpool::error::{RequestError, RuntimeError};
use ctfpool::http::SessionClient;
use ctfpool::manager::{session_channels, Creator, Dispatcher, Reaper, ShutdownController};
use ctfpool::metrics::NoOpObserver;
use ctfpool::proxy::ReverseProxy;
use ctfpool::session::{Session, SessionFactory};

/// Runtime mock handing out container ids `c1, c2, ...` in creation order
/// and recording every stop and network removal.
#[derive(Default)]
struct MockRuntime {
    next_container: Mutex<u32>,
    created: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    networks_removed: Mutex<Vec<String>>,
    /// Container ids whose stop calls fail.
    fail_stop: Mutex<Vec<String>>,
}

impl MockRuntime {
    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn stops(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    fn networks_removed(&self) -> Vec<String> {
        self.networks_removed.lock().unwrap().clone()
    }

    /// Containers created and not yet stopped.
    fn live(&self) -> usize {
        let stopped = self.stopped.lock().unwrap();
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|id| !stopped.contains(id))
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_network(&self, name: &str) -> Result<String, RuntimeError> {
        Ok(format!("net-{name}"))
    }

    async fn run_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut next = self.next_container.lock().unwrap();
        *next += 1;
        let id = format!("c{next}");
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn exec(
        &self,
        _container_id: &str,
        _argv: Vec<String>,
        _timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _grace: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        if self.fail_stop.lock().unwrap().contains(&container_id.to_string()) {
            return Err(RuntimeError::Stop {
                container_id: container_id.to_string(),
                reason: "stop refused".to_string(),
            });
        }
        self.stopped.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError> {
        self.networks_removed
            .lock()
            .unwrap()
            .push(network_id.to_string());
        Ok(())
    }

    async fn build_image(&self, _src_dir: &Path, _tag: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

struct Harness {
    runtime: Arc<MockRuntime>,
    /// Clone of the warm pool sender, kept to observe remaining capacity.
    warm_tx: mpsc::Sender<Session>,
    client: SessionClient,
    controller: ShutdownController,
    creator_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<Dispatcher>,
    reaper_task: JoinHandle<Reaper>,
    proxy: ReverseProxy,
}

struct HarnessConfig {
    max_warm: usize,
    max_active: usize,
    lifetime: Duration,
    reap_interval: Duration,
    min_request_interval: Duration,
    request_deadline: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_warm: 2,
            max_active: 2,
            lifetime: Duration::from_secs(150 * 60),
            reap_interval: Duration::from_secs(10 * 60),
            min_request_interval: Duration::from_secs(5 * 60),
            request_deadline: Duration::from_secs(8),
        }
    }
}

fn spawn_core(config: HarnessConfig) -> Harness {
    let runtime = Arc::new(MockRuntime::default());
    let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let observer = Arc::new(NoOpObserver);

    let channels = session_channels(config.max_warm, config.max_active);
    let (controller, signal) = ShutdownController::new();

    let proxy = ReverseProxy {
        network_id: "net-reverseProxy".to_string(),
        container_id: "proxy".to_string(),
    };

    let factory = SessionFactory::new(
        dyn_runtime.clone(),
        "entrypoint".to_string(),
        proxy.network_id.clone(),
        proxy.container_id.clone(),
    );

    let creator = Creator::new(
        factory,
        dyn_runtime.clone(),
        channels.warm_tx.clone(),
        signal.clone(),
        observer.clone(),
    );
    let dispatcher = Dispatcher::new(
        channels.request_rx,
        channels.warm_rx,
        channels.active_tx,
        config.min_request_interval,
        signal.clone(),
        observer.clone(),
    );
    let reaper = Reaper::new(
        channels.active_rx,
        dyn_runtime,
        config.lifetime,
        config.reap_interval,
        signal,
        observer,
    );

    Harness {
        runtime,
        warm_tx: channels.warm_tx,
        client: SessionClient::new(channels.request_tx, config.request_deadline),
        controller,
        creator_task: tokio::spawn(creator.run()),
        dispatcher_task: tokio::spawn(dispatcher.run()),
        reaper_task: tokio::spawn(reaper.run()),
        proxy,
    }
}

/// Let every runnable task make progress without advancing the clock.
async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn s1_warm_up_fills_the_pool_and_blocks_the_creator() {
    let harness = spawn_core(HarnessConfig::default());
    settle().await;

    // Two sessions pooled, a third built and blocked waiting for a slot.
    assert_eq!(harness.warm_tx.capacity(), 0, "warm pool should be full");
    assert_eq!(harness.runtime.created_count(), 3);
    assert!(harness.runtime.stops().is_empty());

    // Live sessions never exceed max_warm + max_active + 2.
    assert!(harness.runtime.live() <= 2 + 2 + 2);
}

#[tokio::test(start_paused = true)]
async fn s2_single_dispatch_delivers_oldest_session_and_refills() {
    let harness = spawn_core(HarnessConfig::default());
    settle().await;

    let session = harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("dispatch should succeed");

    assert_eq!(session.container_ids, vec!["c1".to_string()]);
    assert_eq!(session.name, &session.username[..6]);
    let activated = session.time_activated.expect("delivered session is stamped");
    assert!(activated >= session.time_created);

    settle().await;
    // The creator refilled the slot and is blocked building the next spare.
    assert_eq!(harness.warm_tx.capacity(), 0, "warm pool should be refilled");
    assert_eq!(harness.runtime.created_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn s3_second_request_inside_window_is_throttled() {
    let harness = spawn_core(HarnessConfig::default());
    settle().await;

    let ip = "10.0.0.1".parse().unwrap();
    harness.client.request(ip).await.expect("first request");

    tokio::time::advance(Duration::from_secs(30)).await;
    let error = harness.client.request(ip).await.unwrap_err();
    assert_eq!(error, RequestError::TooSoon);

    // Nothing was taken from the pool or reaped for the throttled request.
    settle().await;
    assert!(harness.runtime.stops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn throttle_window_reopens_after_min_interval() {
    let harness = spawn_core(HarnessConfig::default());
    settle().await;

    let ip = "10.0.0.1".parse().unwrap();
    let first = harness.client.request(ip).await.expect("first request");

    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    settle().await;
    let second = harness.client.request(ip).await.expect("post-window request");

    assert_ne!(first.container_ids, second.container_ids);
    assert_ne!(first.username, second.username);
}

#[tokio::test(start_paused = true)]
async fn s4_expired_session_is_reaped_in_fifo_order() {
    let harness = spawn_core(HarnessConfig {
        lifetime: Duration::from_secs(60),
        reap_interval: Duration::from_secs(10),
        ..Default::default()
    });
    settle().await;

    let session = harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("dispatch");
    assert_eq!(session.container_ids, vec!["c1".to_string()]);

    // Several reaper ticks pass before expiry; nothing may be stopped early.
    tokio::time::sleep(Duration::from_secs(45)).await;
    settle().await;
    assert!(harness.runtime.stops().is_empty());

    tokio::time::sleep(Duration::from_secs(25)).await;
    settle().await;
    assert_eq!(harness.runtime.stops(), vec!["c1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn s5_dispatch_blocks_at_the_active_ceiling_until_a_slot_frees() {
    let harness = spawn_core(HarnessConfig {
        max_active: 1,
        lifetime: Duration::from_secs(60),
        reap_interval: Duration::from_secs(10),
        // Long deadline so the blocked third request can outlive the reaper
        // tick that frees a slot.
        request_deadline: Duration::from_secs(300),
        ..Default::default()
    });
    settle().await;

    let first = harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("first dispatch fills the active set");
    assert_eq!(first.container_ids, vec!["c1".to_string()]);

    // Second dispatch is answered, then the dispatcher blocks putting it on
    // the full active set.
    let second = harness
        .client
        .request("10.0.0.2".parse().unwrap())
        .await
        .expect("second dispatch is still answered");
    assert_eq!(second.container_ids, vec!["c2".to_string()]);

    // Third request cannot be served while the dispatcher is blocked.
    let client = harness.client.clone();
    let third = tokio::spawn(async move { client.request("10.0.0.3".parse().unwrap()).await });
    settle().await;
    assert!(!third.is_finished(), "third dispatch must wait, not error");

    // Once the first session expires the reaper frees a slot, the blocked
    // put completes, and the third request is served.
    tokio::time::sleep(Duration::from_secs(75)).await;
    settle().await;

    let third = third.await.expect("request task").expect("third dispatch");
    assert_eq!(third.container_ids, vec!["c3".to_string()]);
    assert!(harness.runtime.stops().contains(&"c1".to_string()));

    assert!(harness.runtime.live() <= 2 + 1 + 2);
}

#[tokio::test(start_paused = true)]
async fn s6_shutdown_reclaims_every_session_before_proxy_teardown() {
    let harness = spawn_core(HarnessConfig {
        max_warm: 1,
        ..Default::default()
    });
    settle().await;

    // One session delivered (active), one warm, one in the creator's hand.
    harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("dispatch");
    settle().await;
    assert_eq!(harness.runtime.created_count(), 3);

    harness.controller.shutdown();
    harness.creator_task.await.unwrap();
    let dispatcher = harness.dispatcher_task.await.unwrap();
    let reaper = harness.reaper_task.await.unwrap();

    ctfpool::manager::shutdown::drain_sessions(harness.runtime.as_ref(), dispatcher, reaper).await;
    ctfpool::proxy::teardown(harness.runtime.as_ref(), &harness.proxy)
        .await
        .expect("proxy teardown");

    let stops = harness.runtime.stops();
    // Every session container was stopped, and the proxy went down last.
    for id in ["c1", "c2", "c3"] {
        assert!(stops.contains(&id.to_string()), "missing stop for {id}");
    }
    assert_eq!(stops.last().map(String::as_str), Some("proxy"));
    let proxy_position = stops.iter().position(|id| id == "proxy").unwrap();
    for id in ["c1", "c2", "c3"] {
        let position = stops.iter().position(|s| s == id).unwrap();
        assert!(position < proxy_position, "{id} stopped after the proxy");
    }
    assert_eq!(
        harness.runtime.networks_removed(),
        vec!["net-reverseProxy".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn empty_pool_reports_no_sessions_and_still_throttles() {
    // Dispatcher without a creator: the warm pool stays empty.
    let runtime = Arc::new(MockRuntime::default());
    let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let observer = Arc::new(NoOpObserver);
    let channels = session_channels(2, 2);
    let (_controller, signal) = ShutdownController::new();

    let dispatcher = Dispatcher::new(
        channels.request_rx,
        channels.warm_rx,
        channels.active_tx,
        Duration::from_secs(5 * 60),
        signal.clone(),
        observer.clone(),
    );
    let _dispatcher_task = tokio::spawn(dispatcher.run());
    let _reaper_task = tokio::spawn(
        Reaper::new(
            channels.active_rx,
            dyn_runtime,
            Duration::from_secs(60),
            Duration::from_secs(10),
            signal,
            observer,
        )
        .run(),
    );

    let client = SessionClient::new(channels.request_tx, Duration::from_secs(8));
    let ip = "10.0.0.1".parse().unwrap();

    let error = client.request(ip).await.unwrap_err();
    assert_eq!(error, RequestError::NoSessionsAvailable);

    // The throttle table was updated before the pool was found empty, so an
    // immediate retry is throttled rather than told the pool is empty.
    let error = client.request(ip).await.unwrap_err();
    assert_eq!(error, RequestError::TooSoon);
}

#[tokio::test(start_paused = true)]
async fn reaper_defers_sweep_when_a_stop_fails() {
    let harness = spawn_core(HarnessConfig {
        lifetime: Duration::from_secs(60),
        reap_interval: Duration::from_secs(10),
        ..Default::default()
    });
    settle().await;

    let first = harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("first dispatch");
    assert_eq!(first.container_ids, vec!["c1".to_string()]);
    harness
        .client
        .request("10.0.0.2".parse().unwrap())
        .await
        .expect("second dispatch");

    // c1's stop fails: the reaper must drop it and defer, not spin.
    harness
        .runtime
        .fail_stop
        .lock()
        .unwrap()
        .push("c1".to_string());

    tokio::time::sleep(Duration::from_secs(70)).await;
    settle().await;
    // c1 dropped (stop failed), c2 not yet touched in the same sweep.
    assert!(!harness.runtime.stops().contains(&"c1".to_string()));

    // Next tick resumes the sweep and reaps the (also expired) c2.
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert!(harness.runtime.stops().contains(&"c2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn distinct_clients_are_throttled_independently() {
    let harness = spawn_core(HarnessConfig::default());
    settle().await;

    harness
        .client
        .request("10.0.0.1".parse().unwrap())
        .await
        .expect("first client");
    let other = harness.client.request("10.0.0.2".parse().unwrap()).await;
    assert!(other.is_ok(), "a different client must not be throttled");
}
