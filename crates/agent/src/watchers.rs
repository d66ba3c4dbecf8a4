//! Kubernetes watchers feeding the discovery engine
//!
//! Pods and services become [`ResourceEvent`]s for the manager. ConfigMaps
//! and Secrets carrying discovery rules go straight to the [`ConfigHandler`].

use async_trait::async_trait;
use discovery_lib::{
    ConfigHandler, ConfigSource, Container, ObjectMeta, Resource, ResourceEvent, ResourceKind,
    ResourceWatcher,
};
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::{Api, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Pods, limited to one node in daemon mode
pub struct PodWatcher {
    client: Client,
    node_name: Option<String>,
}

impl PodWatcher {
    pub fn new(client: Client, node_name: Option<String>) -> Self {
        Self { client, node_name }
    }
}

#[async_trait]
impl ResourceWatcher for PodWatcher {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pod
    }

    async fn watch(
        &self,
        events: mpsc::Sender<ResourceEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut config = watcher::Config::default();
        if let Some(node) = &self.node_name {
            config = config.fields(&format!("spec.nodeName={node}"));
        }
        let api: Api<Pod> = Api::all(self.client.clone());
        forward(watcher(api, config), pod_event, events, shutdown).await
    }
}

/// Services across all namespaces
pub struct ServiceWatcher {
    client: Client,
}

impl ServiceWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceWatcher for ServiceWatcher {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Service
    }

    async fn watch(
        &self,
        events: mpsc::Sender<ResourceEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let api: Api<Service> = Api::all(self.client.clone());
        forward(
            watcher(api, watcher::Config::default()),
            service_event,
            events,
            shutdown,
        )
        .await
    }
}

/// Relay watch events until shutdown or until the receiver goes away
async fn forward<K, S>(
    stream: S,
    convert: fn(watcher::Event<K>) -> ResourceEvent,
    events: mpsc::Sender<ResourceEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    K: Send,
{
    let stream = stream.default_backoff();
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            next = stream.try_next() => match next {
                Ok(Some(event)) => {
                    if events.send(convert(event)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => warn!(error = %e, "watch error, retrying"),
            },
        }
    }
}

fn pod_event(event: watcher::Event<Pod>) -> ResourceEvent {
    match event {
        watcher::Event::Applied(pod) => match running_pod(&pod) {
            Some(resource) => ResourceEvent::Applied(resource),
            // not running any more
            None => ResourceEvent::Deleted(pod_resource(&pod)),
        },
        watcher::Event::Deleted(pod) => ResourceEvent::Deleted(pod_resource(&pod)),
        watcher::Event::Restarted(pods) => {
            ResourceEvent::Restarted(pods.iter().filter_map(running_pod).collect())
        }
    }
}

fn service_event(event: watcher::Event<Service>) -> ResourceEvent {
    match event {
        watcher::Event::Applied(service) => match addressable_service(&service) {
            Some(resource) => ResourceEvent::Applied(resource),
            None => ResourceEvent::Deleted(service_resource(&service)),
        },
        watcher::Event::Deleted(service) => ResourceEvent::Deleted(service_resource(&service)),
        watcher::Event::Restarted(services) => ResourceEvent::Restarted(
            services.iter().filter_map(addressable_service).collect(),
        ),
    }
}

fn object_meta(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
    }
}

pub fn pod_resource(pod: &Pod) -> Resource {
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| {
                    let ports = c
                        .ports
                        .iter()
                        .flatten()
                        .map(|p| p.container_port)
                        .collect();
                    Container::new(c.image.clone().unwrap_or_default(), ports)
                })
                .collect()
        })
        .unwrap_or_default();
    Resource::pod(ip, object_meta(&pod.metadata), containers)
}

/// Pods are only discovered while running with an IP
pub fn running_pod(pod: &Pod) -> Option<Resource> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    let resource = pod_resource(pod);
    (!resource.ip.is_empty()).then_some(resource)
}

pub fn service_resource(service: &Service) -> Resource {
    let ip = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .unwrap_or_default();
    Resource::service(ip, object_meta(&service.metadata))
}

/// Services are only discovered with a cluster IP, headless services are skipped
pub fn addressable_service(service: &Service) -> Option<Resource> {
    let resource = service_resource(service);
    discovery_lib::resource::has_ip(&resource.ip).then_some(resource)
}

/// Runtime config source named after a ConfigMap
pub fn config_source(config_map: &ConfigMap) -> ConfigSource {
    let meta = object_meta(&config_map.metadata);
    let mut source = ConfigSource::new(source_name(CONFIG_MAP_SOURCE, &meta.name));
    source.annotations = meta.annotations;
    source.data = config_map.data.clone().unwrap_or_default();
    source
}

/// Runtime config source named after a Secret
///
/// The apiserver base64 encodes secret data; it arrives here already decoded.
pub fn secret_source(secret: &Secret) -> ConfigSource {
    let meta = object_meta(&secret.metadata);
    let mut source = ConfigSource::new(source_name(SECRET_SOURCE, &meta.name));
    source.annotations = meta.annotations;
    source.data = secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
        .collect();
    source
}

const CONFIG_MAP_SOURCE: &str = "configmap";
const SECRET_SOURCE: &str = "secret";

/// How often secret access is re-checked while denied
const SECRET_ACCESS_RETRY: Duration = Duration::from_secs(60);

/// How often a denied secret access is reported
const SECRET_ACCESS_REPORT: Duration = Duration::from_secs(12 * 60 * 60);

/// Object names never contain `/`, so sources of different kinds never clash
fn source_name(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Replace the runtime sources of one kind with a complete listing
pub fn resync_sources(handler: &ConfigHandler, kind: &str, sources: &[ConfigSource]) {
    let prefix = source_name(kind, "");
    let present: HashSet<&str> = sources.iter().map(|s| s.name.as_str()).collect();
    for name in handler.runtime_source_names() {
        if name.starts_with(&prefix) && !present.contains(name.as_str()) {
            handler.deleted(&name);
        }
    }
    for source in sources {
        handler.updated(source);
    }
}

/// Feed objects of one kind into the config handler until shutdown
async fn watch_sources<K>(
    api: Api<K>,
    kind: &'static str,
    convert: fn(&K) -> ConfigSource,
    handler: &ConfigHandler,
    shutdown: &mut broadcast::Receiver<()>,
) where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            next = stream.try_next() => match next {
                Ok(Some(watcher::Event::Applied(obj))) => handler.updated(&convert(&obj)),
                Ok(Some(watcher::Event::Deleted(obj))) => handler.deleted(&convert(&obj).name),
                Ok(Some(watcher::Event::Restarted(objs))) => {
                    let sources: Vec<ConfigSource> = objs.iter().map(convert).collect();
                    resync_sources(handler, kind, &sources);
                }
                Ok(None) => break,
                Err(e) => warn!(kind, error = %e, "runtime config watch error, retrying"),
            },
        }
    }
    debug!(kind, "runtime config watcher stopped");
}

/// Feed ConfigMaps of a namespace into the config handler until shutdown
pub async fn watch_config_maps(
    client: Client,
    namespace: String,
    handler: Arc<ConfigHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(namespace = %namespace, "watching runtime discovery configmaps");
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    watch_sources(api, CONFIG_MAP_SOURCE, config_source, &handler, &mut shutdown).await;
}

/// Feed Secrets of a namespace into the config handler until shutdown
///
/// Secrets are only watched once the agent is allowed to list them; access
/// is re-checked every minute until then.
pub async fn watch_secrets(
    client: Client,
    namespace: String,
    handler: Arc<ConfigHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last_reported: Option<Instant> = None;
    loop {
        if can_list_secrets(&client, &namespace).await {
            break;
        }
        if last_reported.map_or(true, |at| at.elapsed() >= SECRET_ACCESS_REPORT) {
            info!(namespace = %namespace, "secret access disabled for runtime discovery configuration");
            last_reported = Some(Instant::now());
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(SECRET_ACCESS_RETRY) => {}
        }
    }

    info!(namespace = %namespace, "watching runtime discovery secrets");
    let api: Api<Secret> = Api::namespaced(client, &namespace);
    watch_sources(api, SECRET_SOURCE, secret_source, &handler, &mut shutdown).await;
}

/// Review asking whether this agent may list secrets in `namespace`
pub fn secret_access_review(namespace: &str) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: Some("list".to_string()),
                resource: Some("secrets".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn review_allowed(review: &SelfSubjectAccessReview) -> bool {
    review.status.as_ref().is_some_and(|status| status.allowed)
}

async fn can_list_secrets(client: &Client, namespace: &str) -> bool {
    let api: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    match api
        .create(&PostParams::default(), &secret_access_review(namespace))
        .await
    {
        Ok(review) => review_allowed(&review),
        Err(e) => {
            error!(error = %e, "unable to check secret access");
            false
        }
    }
}
