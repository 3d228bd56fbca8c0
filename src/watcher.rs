use crate::config::Config;
use crate::error::WatchError;
use crate::state::PodObservation;
use anyhow::Context;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a client from `kubeconfig` when given, otherwise from the in-cluster service account.
/// An unusable kubeconfig falls back to the in-cluster configuration as well.
pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    info!("Initializing Kubernetes client");
    let config = match kubeconfig {
        Some(path) => match load_kubeconfig(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("{:?}, falling back to in-cluster configuration", e);
                kube::Config::incluster().context("Failed to load in-cluster configuration")?
            }
        },
        None => kube::Config::incluster().context("Failed to load in-cluster configuration")?,
    };
    let client = Client::try_from(config)?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

async fn load_kubeconfig(path: &Path) -> anyhow::Result<kube::Config> {
    info!("Loading kubeconfig from {}", path.display());
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("Failed to load kubeconfig {}", path.display()))?;
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub resync_interval: Duration,
    pub sync_timeout: Duration,
}

impl From<&Config> for WatchSettings {
    fn from(config: &Config) -> Self {
        WatchSettings {
            namespace: config.namespace.clone(),
            resync_interval: config.resync_interval,
            sync_timeout: config.sync_timeout,
        }
    }
}

pub struct PodWatcher {
    client: Client,
    settings: WatchSettings,
}

impl PodWatcher {
    pub fn new(client: Client, settings: WatchSettings) -> Self {
        Self { client, settings }
    }

    /// Watches Pods until `cancel` fires. Fails if the initial sync does not finish in time.
    pub async fn run(
        self,
        sender: mpsc::Sender<PodObservation>,
        ready: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let api: Api<Pod> = match &self.settings.namespace {
            Some(namespace) => {
                info!("Watching pods in namespace {}", namespace);
                Api::namespaced(self.client.clone(), namespace)
            }
            None => {
                info!("Watching pods in all namespaces");
                Api::all(self.client.clone())
            }
        };

        let (reader, writer) = reflector::store();
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer);

        watch_pods(&self.settings, stream, reader, sender, ready, cancel).await
    }
}

pub async fn watch_pods<S, E>(
    settings: &WatchSettings,
    stream: S,
    reader: Store<Pod>,
    sender: mpsc::Sender<PodObservation>,
    ready: watch::Sender<bool>,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    S: Stream<Item = Result<watcher::Event<Pod>, E>>,
    E: Display,
{
    let mut synced = ready.subscribe();
    let dispatch = dispatch_events(stream, sender.clone(), ready);
    tokio::pin!(dispatch);

    let wait_for_sync = async { synced.wait_for(|s| *s).await.map(|_| ()) };
    tokio::select! {
        result = &mut dispatch => {
            result?;
            return Ok(());
        }
        result = tokio::time::timeout(settings.sync_timeout, wait_for_sync) => match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(WatchError::StreamEnded.into()),
            Err(_) => return Err(WatchError::SyncTimeout(settings.sync_timeout).into()),
        },
        _ = cancel.cancelled() => return Ok(()),
    }

    let mut scheduler = start_resync(settings.resync_interval, reader, sender).await?;

    let result = tokio::select! {
        result = &mut dispatch => result.map_err(anyhow::Error::from),
        _ = cancel.cancelled() => {
            info!("Stopping pod watcher");
            Ok(())
        }
    };
    scheduler.shutdown().await?;
    result
}

/// Forwards Pod adds and updates to `sender` and flips `ready` once the first full list is
/// cached. Pods of a (re)list are held back until the list is complete, so the sync never
/// waits on the queue. Returns `Ok` when the receiving side hangs up.
pub async fn dispatch_events<S, E>(
    stream: S,
    sender: mpsc::Sender<PodObservation>,
    ready: watch::Sender<bool>,
) -> Result<(), WatchError>
where
    S: Stream<Item = Result<watcher::Event<Pod>, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut listed: Vec<PodObservation> = Vec::new();
    while let Some(event) = stream.next().await {
        let observations = match event {
            Ok(watcher::Event::Apply(pod)) => vec![PodObservation::from(&pod)],
            Ok(watcher::Event::InitApply(pod)) => {
                listed.push(PodObservation::from(&pod));
                continue;
            }
            Ok(watcher::Event::InitDone) => {
                if !*ready.borrow() {
                    info!("Pod cache synced with {} pods", listed.len());
                }
                ready.send_replace(true);
                std::mem::take(&mut listed)
            }
            Ok(watcher::Event::Init) => {
                debug!("Listing pods");
                listed.clear();
                continue;
            }
            Ok(watcher::Event::Delete(_)) => continue,
            Err(e) => {
                warn!("Pod watch failed, retrying: {}", e);
                continue;
            }
        };

        for observation in observations {
            debug!("Observed pod {}", observation);
            if sender.send(observation).await.is_err() {
                info!("Pod observation receiver closed");
                return Ok(());
            }
        }
    }
    Err(WatchError::StreamEnded)
}

async fn start_resync(
    interval: Duration,
    reader: Store<Pod>,
    sender: mpsc::Sender<PodObservation>,
) -> anyhow::Result<JobScheduler> {
    info!("Resyncing cached pods every {:?}", interval);
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let reader = reader.clone();
        let sender = sender.clone();
        Box::pin(async move {
            let delivered = resync(&reader, &sender);
            debug!("Resync delivered {} pods", delivered);
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

/// Re-delivers every cached Pod. Stops early when the queue is full, the next resync
/// picks up where the reconciler left off.
pub fn resync(reader: &Store<Pod>, sender: &mpsc::Sender<PodObservation>) -> usize {
    let mut delivered = 0;
    for pod in reader.state() {
        match sender.try_send(PodObservation::from(pod.as_ref())) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                debug!("Pod observation queue is full, skipping rest of resync");
                break;
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::pod;
    use futures::stream;
    use kube::runtime::watcher::Event;

    type TestEvent = Result<Event<Pod>, String>;

    fn settings(sync_timeout: Duration) -> WatchSettings {
        WatchSettings {
            namespace: None,
            resync_interval: Duration::from_secs(3600),
            sync_timeout,
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_adds_and_updates() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image-a"], &[]))),
            Ok(Event::InitDone),
            Ok(Event::Apply(pod("default", "b", &["image-b"], &[]))),
            Err("connection reset".to_string()),
            Ok(Event::Delete(pod("default", "c", &["image-c"], &[]))),
            Ok(Event::Apply(pod("default", "a", &["image-a2"], &[]))),
        ];
        let (sender, mut receiver) = mpsc::channel(16);
        let (ready, ready_rx) = watch::channel(false);

        let result = dispatch_events(stream::iter(events), sender, ready).await;
        assert!(matches!(result, Err(WatchError::StreamEnded)));
        assert!(*ready_rx.borrow());

        let mut names = Vec::new();
        while let Ok(observation) = receiver.try_recv() {
            names.push(format!("{}:{}", observation, observation.container_images[0]));
        }
        assert_eq!(
            names,
            vec![
                "default/a:image-a",
                "default/b:image-b",
                "default/a:image-a2",
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_marks_ready_before_queueing_listed_pods() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image-a"], &[]))),
            Ok(Event::InitApply(pod("default", "b", &["image-b"], &[]))),
            Ok(Event::InitDone),
        ];
        let (sender, mut receiver) = mpsc::channel(1);
        let (ready, mut ready_rx) = watch::channel(false);

        let dispatch = tokio::spawn(dispatch_events(stream::iter(events), sender, ready));
        ready_rx.wait_for(|s| *s).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().to_string(), "default/a");
        assert_eq!(receiver.recv().await.unwrap().to_string(), "default/b");
        let result = dispatch.await.unwrap();
        assert!(matches!(result, Err(WatchError::StreamEnded)));
    }

    #[tokio::test]
    async fn test_dispatch_relist_drops_unfinished_list() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "stale", &["image"], &[]))),
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image"], &[]))),
            Ok(Event::InitDone),
        ];
        let (sender, mut receiver) = mpsc::channel(16);
        let (ready, _ready_rx) = watch::channel(false);

        let _ = dispatch_events(stream::iter(events), sender, ready).await;

        assert_eq!(receiver.try_recv().unwrap().to_string(), "default/a");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_stops_when_receiver_closed() {
        let events: Vec<TestEvent> = vec![Ok(Event::Apply(pod("default", "a", &["image"], &[])))];
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let (ready, _ready_rx) = watch::channel(false);

        let result = dispatch_events(stream::iter(events), sender, ready).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_not_ready_before_init_done() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image"], &[]))),
        ];
        let (sender, mut receiver) = mpsc::channel(16);
        let (ready, ready_rx) = watch::channel(false);

        let _ = dispatch_events(stream::iter(events), sender, ready).await;
        assert!(!*ready_rx.borrow());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_times_out_without_sync() {
        let (reader, _writer) = reflector::store::<Pod>();
        let (sender, _receiver) = mpsc::channel(16);
        let (ready, _ready_rx) = watch::channel(false);

        let result = watch_pods(
            &settings(Duration::from_millis(50)),
            stream::pending::<TestEvent>(),
            reader,
            sender,
            ready,
            CancellationToken::new(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WatchError>(),
            Some(WatchError::SyncTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_fails_when_stream_ends_before_sync() {
        let (reader, _writer) = reflector::store::<Pod>();
        let (sender, _receiver) = mpsc::channel(16);
        let (ready, _ready_rx) = watch::channel(false);

        let result = watch_pods(
            &settings(Duration::from_secs(5)),
            stream::iter(Vec::<TestEvent>::new()),
            reader,
            sender,
            ready,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result.unwrap_err().downcast_ref::<WatchError>(),
            Some(WatchError::StreamEnded)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_delivers_and_stops_on_cancel() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image-a"], &[]))),
            Ok(Event::InitDone),
        ];
        let (reader, _writer) = reflector::store::<Pod>();
        let (sender, mut receiver) = mpsc::channel(16);
        let (ready, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let settings = settings(Duration::from_secs(5));
        let watch = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                watch_pods(
                    &settings,
                    stream::iter(events).chain(stream::pending()),
                    reader,
                    sender,
                    ready,
                    cancel,
                )
                .await
            }
        });

        let observation = receiver.recv().await.unwrap();
        assert_eq!(observation.to_string(), "default/a");

        cancel.cancel();
        watch.await.unwrap().unwrap();
        assert!(*ready_rx.borrow());
    }

    #[tokio::test]
    async fn test_watch_syncs_while_queue_is_full() {
        let events: Vec<TestEvent> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("default", "a", &["image-a"], &[]))),
            Ok(Event::InitApply(pod("default", "b", &["image-b"], &[]))),
            Ok(Event::InitApply(pod("default", "c", &["image-c"], &[]))),
            Ok(Event::InitDone),
        ];
        let (reader, _writer) = reflector::store::<Pod>();
        let (sender, mut receiver) = mpsc::channel(1);
        let (ready, mut ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let settings = settings(Duration::from_millis(200));
        let watch = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                watch_pods(
                    &settings,
                    stream::iter(events).chain(stream::pending()),
                    reader,
                    sender,
                    ready,
                    cancel,
                )
                .await
            }
        });

        ready_rx.wait_for(|s| *s).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!watch.is_finished());

        cancel.cancel();
        watch.await.unwrap().unwrap();
        assert_eq!(receiver.recv().await.unwrap().to_string(), "default/a");
    }

    #[tokio::test]
    async fn test_resync_redelivers_cached_pods() {
        let (reader, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&Event::Apply(pod("default", "a", &["image-a"], &[])));
        writer.apply_watcher_event(&Event::Apply(pod("kube-system", "b", &["image-b"], &[])));
        let (sender, mut receiver) = mpsc::channel(16);

        assert_eq!(resync(&reader, &sender), 2);

        let mut names = vec![
            receiver.try_recv().unwrap().to_string(),
            receiver.try_recv().unwrap().to_string(),
        ];
        names.sort();
        assert_eq!(names, vec!["default/a", "kube-system/b"]);
    }

    #[tokio::test]
    async fn test_resync_stops_when_queue_full() {
        let (reader, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&Event::Apply(pod("default", "a", &["image-a"], &[])));
        writer.apply_watcher_event(&Event::Apply(pod("default", "b", &["image-b"], &[])));
        let (sender, _receiver) = mpsc::channel(1);

        assert_eq!(resync(&reader, &sender), 1);
    }
}
