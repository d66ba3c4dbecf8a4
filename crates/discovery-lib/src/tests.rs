//! End to end discovery scenarios
//!
//! These drive the discoverer the way the manager does, with a recording
//! provider handler standing in for the metrics pipeline.

#[cfg(test)]
mod scenario_tests {
    use crate::config::{ConfigHandler, ConfigSource, DiscoveryConfig, PluginConfig, Selectors};
    use crate::discoverer::Discoverer;
    use crate::encoder::{Discovered, ScrapeConfig};
    use crate::leadership::Leadership;
    use crate::observability::StructuredLogger;
    use crate::registry::Registries;
    use crate::resource::{Container, ObjectMeta, Resource};
    use crate::testing::RecordingProviders;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const REDIS_PROVIDER: &str = "telegraf_metrics_source: pod/cache/redis-0";
    const WEB_PROVIDER: &str = "prometheus_metrics_source: pod/default/web-0";

    struct Harness {
        discoverer: Discoverer,
        providers: Arc<RecordingProviders>,
        leadership: Arc<Leadership>,
    }

    fn harness() -> Harness {
        let providers = Arc::new(RecordingProviders::default());
        let leadership = Leadership::new(true, StructuredLogger::new("node-1"));
        let discoverer = Discoverer::new(
            &DiscoveryConfig::default(),
            "node-1",
            Arc::new(Registries::new()),
            providers.clone(),
            leadership.clone(),
            StructuredLogger::new("node-1"),
        );
        Harness {
            discoverer,
            providers,
            leadership,
        }
    }

    fn rule(name: &str, plugin_type: &str, images: &[&str]) -> PluginConfig {
        PluginConfig {
            selectors: Selectors {
                images: images.iter().map(|i| i.to_string()).collect(),
                ..Default::default()
            },
            ..PluginConfig::new(name, plugin_type)
        }
    }

    fn redis_pod(ip: &str) -> Resource {
        Resource::pod(
            ip,
            ObjectMeta::new("redis-0", "cache").with_label("app", "redis"),
            vec![Container::new("redis:6.2", vec![6379])],
        )
    }

    fn web_pod(annotated: bool) -> Resource {
        let mut meta = ObjectMeta::new("web-0", "default").with_label("app", "web");
        if annotated {
            meta = meta.with_annotation("prometheus.io/scrape", "true");
        }
        Resource::pod("10.0.1.4", meta, vec![Container::new("nginx:1.25", vec![80])])
    }

    fn telegraf_conf(providers: &RecordingProviders, name: &str) -> String {
        match providers.provider(name).map(|p| p.config().clone()) {
            Some(ScrapeConfig::Telegraf(cfg)) => cfg.conf,
            other => panic!("expected a telegraf provider, got {other:?}"),
        }
    }

    #[test]
    fn test_redis_add_update_delete() {
        let h = harness();
        h.discoverer
            .handle_all(&[rule("redis", "telegraf/redis", &["redis:*"])]);

        h.discoverer.discover(&redis_pod("10.0.0.5"));
        assert_eq!(h.providers.live(), vec![REDIS_PROVIDER]);
        assert_eq!(
            telegraf_conf(&h.providers, REDIS_PROVIDER),
            "servers = [\"tcp://10.0.0.5:6379\"]\n"
        );

        h.discoverer.discover(&redis_pod("10.0.0.6"));
        assert_eq!(h.providers.added().len(), 2);
        assert_eq!(h.providers.live(), vec![REDIS_PROVIDER]);
        assert_eq!(
            telegraf_conf(&h.providers, REDIS_PROVIDER),
            "servers = [\"tcp://10.0.0.6:6379\"]\n"
        );

        h.discoverer.delete_resource(&redis_pod("10.0.0.6"));
        assert!(h.providers.live().is_empty());
        assert_eq!(h.providers.deleted(), vec![REDIS_PROVIDER]);
    }

    #[test]
    fn test_rediscovery_is_idempotent() {
        let h = harness();
        h.discoverer
            .handle_all(&[rule("redis", "telegraf/redis", &["redis:*"])]);

        for _ in 0..3 {
            h.discoverer.discover(&redis_pod("10.0.0.5"));
        }
        assert_eq!(h.providers.added().len(), 1);

        // reapplying the same rules does not churn targets either
        h.discoverer
            .handle_all(&[rule("redis", "telegraf/redis", &["redis:*"])]);
        h.discoverer.discover(&redis_pod("10.0.0.5"));
        assert_eq!(h.providers.added().len(), 1);
        assert!(h.providers.deleted().is_empty());
    }

    #[test]
    fn test_rule_deletion_cascades_to_targets() {
        let h = harness();
        h.discoverer.handle_all(&[
            rule("redis", "telegraf/redis", &["redis:*"]),
            rule("web", "prometheus", &["nginx:*"]),
        ]);
        h.discoverer.discover(&redis_pod("10.0.0.5"));
        h.discoverer.discover(&web_pod(false));
        assert_eq!(h.providers.live().len(), 2);

        h.discoverer
            .handle_all(&[rule("web", "prometheus", &["nginx:*"])]);
        assert_eq!(h.providers.live(), vec![WEB_PROVIDER]);
        assert_eq!(h.discoverer.count(), 1);

        h.discoverer.delete("web");
        assert!(h.providers.live().is_empty());
        assert_eq!(h.discoverer.count(), 0);
    }

    #[test]
    fn test_rule_takes_precedence_over_annotations() {
        let h = harness();
        h.discoverer.discover(&web_pod(true));
        let provider = h.providers.provider(WEB_PROVIDER).unwrap();
        assert_eq!(provider.config().discovered(), Discovered::Annotation);

        h.discoverer
            .handle_all(&[rule("web", "prometheus", &["nginx:*"])]);
        h.discoverer.discover(&web_pod(true));

        assert_eq!(h.providers.live(), vec![WEB_PROVIDER]);
        let provider = h.providers.provider(WEB_PROVIDER).unwrap();
        assert_eq!(provider.config().discovered(), Discovered::Rule);
        let targets = h.discoverer.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].rule, "web");

        // without the rule the annotation applies again
        h.discoverer.handle_all(&[]);
        assert!(h.providers.live().is_empty());
        h.discoverer.discover(&web_pod(true));
        let provider = h.providers.provider(WEB_PROVIDER).unwrap();
        assert_eq!(provider.config().discovered(), Discovered::Annotation);
    }

    #[test]
    fn test_annotation_removed_drops_target() {
        let h = harness();
        h.discoverer.discover(&web_pod(true));
        assert_eq!(h.providers.live().len(), 1);

        h.discoverer.discover(&web_pod(false));
        assert!(h.providers.live().is_empty());
    }

    #[test]
    fn test_target_names_unique_within_plugin_type() {
        let h = harness();
        h.discoverer.handle_all(&[
            rule("a-web", "prometheus", &["nginx:*"]),
            rule("b-web", "prometheus", &["nginx*"]),
        ]);
        h.discoverer.discover(&web_pod(false));

        let counts: BTreeMap<String, usize> = h
            .discoverer
            .rules()
            .into_iter()
            .map(|r| (r.name, r.targets))
            .collect();
        assert_eq!(counts["a-web"], 1);
        assert_eq!(counts["b-web"], 0);
        assert_eq!(h.providers.live(), vec![WEB_PROVIDER]);

        // once the owner goes away the other rule may claim the name
        h.discoverer.delete("a-web");
        h.discoverer.discover(&web_pod(false));
        assert_eq!(h.discoverer.rules()[0].targets, 1);
        assert_eq!(h.providers.live(), vec![WEB_PROVIDER]);
    }

    #[test]
    fn test_same_resource_in_different_plugin_types() {
        let h = harness();
        h.discoverer.handle_all(&[
            rule("redis", "telegraf/redis", &["redis:*"]),
            rule("redis-exporter", "prometheus", &["redis:*"]),
        ]);
        h.discoverer.discover(&redis_pod("10.0.0.5"));

        assert_eq!(
            h.providers.live(),
            vec![
                "prometheus_metrics_source: pod/cache/redis-0".to_string(),
                REDIS_PROVIDER.to_string(),
            ]
        );
    }

    #[test]
    fn test_resource_no_longer_matching_is_dropped() {
        let h = harness();
        let mut by_label = PluginConfig::new("redis", "telegraf/redis");
        by_label
            .selectors
            .labels
            .insert("app".to_string(), vec!["redis".to_string()]);
        h.discoverer.handle_all(&[by_label]);

        h.discoverer.discover(&redis_pod("10.0.0.5"));
        assert_eq!(h.providers.live().len(), 1);

        let mut relabeled = redis_pod("10.0.0.5");
        relabeled
            .meta
            .labels
            .insert("app".to_string(), "cache".to_string());
        h.discoverer.discover(&relabeled);
        assert!(h.providers.live().is_empty());
    }

    #[test]
    fn test_malformed_port_does_not_affect_siblings() {
        let h = harness();
        let mut bad = rule("bad", "telegraf/redis", &["redis:*"]);
        bad.port = "63x9".to_string();

        let failed = h.discoverer.handle_all(&[
            rule("a-redis", "telegraf/redis", &["redis:*"]),
            bad,
            rule("web", "prometheus", &["nginx:*"]),
        ]);
        assert_eq!(failed, 1);

        let names: Vec<String> = h.discoverer.rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a-redis", "web"]);

        h.discoverer.discover(&redis_pod("10.0.0.5"));
        h.discoverer.discover(&web_pod(false));
        assert_eq!(h.providers.live().len(), 2);
    }

    #[test]
    fn test_api_server_follows_leadership() {
        let h = harness();
        let mut api_server = PluginConfig::new("kube-apiserver", "prometheus");
        api_server.selectors.resource_type = "apiserver".to_string();

        h.discoverer.handle_all(&[api_server]);
        assert!(h.providers.live().is_empty());

        h.leadership.set_leading(true, "node-1");
        h.discoverer.refresh_api_server();
        assert_eq!(
            h.providers.live(),
            vec!["prometheus_metrics_source: apiserver/kube-apiserver"]
        );

        // the new leader owns the target now
        h.leadership.set_leading(false, "node-2");
        h.discoverer.delete_cluster_scoped(&[]);
        assert!(h.providers.live().is_empty());

        h.discoverer.refresh_api_server();
        assert!(h.providers.live().is_empty());
    }

    #[test]
    fn test_dashed_names_do_not_share_a_target() {
        let h = harness();
        h.discoverer
            .handle_all(&[rule("redis", "telegraf/redis", &["redis:*"])]);

        let first = Resource::pod(
            "10.0.0.5",
            ObjectMeta::new("c", "a-b"),
            vec![Container::new("redis:6.2", vec![6379])],
        );
        let second = Resource::pod(
            "10.0.0.6",
            ObjectMeta::new("b-c", "a"),
            vec![Container::new("redis:6.2", vec![6379])],
        );
        h.discoverer.discover(&first);
        h.discoverer.discover(&second);
        assert_eq!(
            h.providers.live(),
            vec![
                "telegraf_metrics_source: pod/a-b/c".to_string(),
                "telegraf_metrics_source: pod/a/b-c".to_string(),
            ]
        );

        h.discoverer.delete_resource(&second);
        assert_eq!(h.providers.live(), vec!["telegraf_metrics_source: pod/a-b/c"]);
        assert_eq!(
            telegraf_conf(&h.providers, "telegraf_metrics_source: pod/a-b/c"),
            "servers = [\"tcp://10.0.0.5:6379\"]\n"
        );
    }

    #[test]
    fn test_leadership_round_trip() {
        const SERVICE_PROVIDER: &str = "prometheus_metrics_source: service/cache/redis";
        const API_SERVER_PROVIDER: &str = "prometheus_metrics_source: apiserver/kube-apiserver";

        let h = harness();
        let mut api_server = PluginConfig::new("kube-apiserver", "prometheus");
        api_server.selectors.resource_type = "apiserver".to_string();
        let mut services = PluginConfig::new("redis-service", "prometheus");
        services.selectors.resource_type = "service".to_string();
        services.selectors.namespaces = vec!["cache".to_string()];
        let rules = vec![
            api_server,
            services,
            rule("redis", "telegraf/redis", &["redis:*"]),
        ];
        let service = Resource::service("10.96.0.20", ObjectMeta::new("redis", "cache"));

        // following: pods only
        h.discoverer.handle_all(&rules);
        h.discoverer.discover(&redis_pod("10.0.0.5"));
        h.discoverer.discover(&service);
        assert_eq!(h.providers.live(), vec![REDIS_PROVIDER]);

        // leading: services and the api server join in
        h.leadership.set_leading(true, "node-1");
        h.discoverer.refresh_api_server();
        h.discoverer.discover(&service);
        assert_eq!(
            h.providers.live(),
            vec![
                API_SERVER_PROVIDER.to_string(),
                SERVICE_PROVIDER.to_string(),
                REDIS_PROVIDER.to_string(),
            ]
        );

        // following again: cluster scoped targets go, late events are ignored
        h.leadership.set_leading(false, "node-2");
        h.discoverer.delete_cluster_scoped(&[service.clone()]);
        h.discoverer.discover(&service);
        h.discoverer.handle_all(&rules);
        h.discoverer.discover(&redis_pod("10.0.0.5"));
        assert_eq!(h.providers.live(), vec![REDIS_PROVIDER]);
        assert_eq!(
            h.providers.deleted(),
            vec![SERVICE_PROVIDER.to_string(), API_SERVER_PROVIDER.to_string()]
        );
    }

    #[test]
    fn test_merged_runtime_rules() {
        fn document(prefix: &str, count: usize) -> String {
            let mut doc = String::from("plugins:\n");
            for i in 0..count {
                doc.push_str(&format!(
                    "- name: {prefix}-{i}\n  type: prometheus\n  selectors:\n    images:\n    - 'img-{prefix}-{i}'\n"
                ));
            }
            doc
        }

        let h = harness();
        let wired = DiscoveryConfig::from_yaml(&document("wired", 3)).unwrap();
        let config = ConfigHandler::new(wired);
        config.updated(
            &ConfigSource::new("runtime-a")
                .annotated()
                .with_entry("plugins.yaml", document("a", 3)),
        );
        config.updated(
            &ConfigSource::new("runtime-b")
                .annotated()
                .with_entry("plugins.yaml", document("b", 2)),
        );

        let (cfg, changed) = config.config();
        assert!(changed);
        h.discoverer.handle_all(&cfg.plugin_configs);
        assert_eq!(h.discoverer.count(), 8);

        config.deleted("runtime-a");
        let (cfg, changed) = config.config();
        assert!(changed);
        h.discoverer.handle_all(&cfg.plugin_configs);
        assert_eq!(h.discoverer.count(), 5);
        assert!(h.discoverer.rules().iter().all(|r| !r.name.starts_with("a-")));
    }
}
