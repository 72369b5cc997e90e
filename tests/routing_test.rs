#[cfg(test)]
mod routing_tests {
    use std::{sync::Arc, time::Duration};

    use chrono::{TimeZone, Utc};
    use mama::{
        agent::types::{CapabilityProfile, QueryMarkup, markup_relevance},
        multi_agent::{
            AgentRecord, Framework, JsonFileStore, MessageListener, Registrar, RegistryStore,
            RouteOutcome, Transport,
            registry::{MarkupMatchStrategy, RegistryTable, SemanticSimilarityStrategy},
        },
        shared::{
            MamaConfig, RegistrarConfig, TransportConfig,
            config::{AgentProfileConfig, BackoffKind, load_agent_profiles},
            shutdown_channel,
        },
    };
    use proptest::prelude::*;
    use serde_json::json;

    const HAPPY_QUERY: &str = "I love this, it's great and good";

    fn profile(positive: f64, negative: f64) -> CapabilityProfile {
        CapabilityProfile::new()
            .with("positive", positive)
            .with("negative", negative)
    }

    fn registration(name: &str, positive: f64, negative: f64, port: u16) -> serde_json::Value {
        json!({
            "agent_name": name,
            "expertise_profile": {"positive": positive, "negative": negative},
            "relevance": 0.0,
            "address": "127.0.0.1",
            "port": port,
        })
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_scenario_a_then_b_after_removal() {
        let registrar = Registrar::in_memory();
        registrar
            .handle_message(registration("A", 1.0, 0.2, 5001))
            .await
            .unwrap();
        registrar
            .handle_message(registration("B", 0.2, 1.0, 5002))
            .await
            .unwrap();

        let best = registrar.rank_agents(HAPPY_QUERY).await.unwrap().unwrap();
        assert_eq!((best.name.as_str(), best.port), ("A", 5001));
        assert!((best.relevance - 0.84).abs() < 1e-9);

        registrar.remove_agent("A").await.unwrap();
        let best = registrar.rank_agents(HAPPY_QUERY).await.unwrap().unwrap();
        assert_eq!(best.name, "B");
    }

    #[tokio::test]
    async fn test_same_name_different_ports_keeps_second() {
        let registrar = Registrar::in_memory();
        registrar
            .handle_message(registration("A", 1.0, 0.2, 5001))
            .await
            .unwrap();
        registrar
            .handle_message(registration("A", 1.0, 0.2, 5009))
            .await
            .unwrap();

        let agents = registrar.list_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].port, 5009);
    }

    #[tokio::test]
    async fn test_semantic_strategy_requires_prompt() {
        let registrar = Registrar::open(
            RegistrarConfig::default(),
            Arc::new(mama::multi_agent::MemoryStore::new()),
            Arc::new(SemanticSimilarityStrategy::default()),
        )
        .unwrap();
        registrar
            .handle_message(registration("silent", 1.0, 1.0, 5001))
            .await
            .unwrap();
        let mut with_prompt = registration("critic", 0.0, 0.0, 5002);
        with_prompt["prompt"] = json!("classify sarcastic movie reviews");
        registrar.handle_message(with_prompt).await.unwrap();

        let best = registrar
            .rank_agents("classify sarcastic movie reviews")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.name, "critic");
        assert!(
            registrar
                .find_next_best("classify sarcastic movie reviews", &["critic".to_string()])
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_registrar_serves_over_the_wire() {
        let transport_config = TransportConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            backoff: BackoffKind::Fixed,
            attempt_timeout_ms: 500,
            max_frame_bytes: 4096,
        };
        let registrar = Arc::new(Registrar::in_memory());
        let listener = MessageListener::bind("127.0.0.1", 0, &transport_config)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let (trigger, shutdown) = shutdown_channel();
        let task = registrar.clone().spawn_serve(listener, shutdown);

        let transport = Transport::new(transport_config);
        // Missing `port`: rejected, and the loop keeps going.
        transport
            .send(
                "127.0.0.1",
                port,
                &json!({"agent_name": "bad", "expertise_profile": {}, "relevance": 0.0, "address": "x"}),
            )
            .await
            .unwrap();
        transport
            .send("127.0.0.1", port, &registration("A", 1.0, 0.2, 5001))
            .await
            .unwrap();
        transport
            .send(
                "127.0.0.1",
                port,
                &json!({"agent_name": "A", "query": "good", "result": "positive", "relevance": 0.8}),
            )
            .await
            .unwrap();

        let watched = registrar.clone();
        eventually(move || {
            let watched = watched.clone();
            async move { watched.history("A").await.len() == 1 }
        })
        .await;

        assert!(registrar.get_agent("bad").await.is_none());
        assert_eq!(registrar.popularity("A").await, Some(0.8));

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_framework_from_yaml_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join("agents");
        std::fs::create_dir(&agents_dir).unwrap();
        std::fs::write(
            agents_dir.join("01_cheerful.yaml"),
            "name: Cheerful\nprofile:\n  positive: 1.0\n  negative: 0.2\n",
        )
        .unwrap();
        std::fs::write(
            agents_dir.join("02_gloomy.yml"),
            "name: Gloomy\nprofile:\n  positive: 0.2\n  negative: 1.0\nbehavior: dark thoughts\n",
        )
        .unwrap();

        let registry_path = dir.path().join("state").join("registry.json");
        let mut config = MamaConfig::from_yaml_str(&format!(
            r#"
registrar:
  port: 0
  registry_path: {}
transport:
  max_attempts: 3
  base_delay_ms: 5
  backoff: fixed
agent:
  registration_base_delay_ms: 5
  reply_timeout_ms: 2000
"#,
            registry_path.display()
        ))
        .unwrap();
        config.agents = load_agent_profiles(&agents_dir).unwrap();
        assert_eq!(config.agents[1].prompt.as_deref(), Some("dark thoughts"));

        let framework = Framework::start_with_agents(config).await.unwrap();
        let registrar = framework.registrar().clone();
        eventually(move || {
            let registrar = registrar.clone();
            async move { registrar.len().await == 2 }
        })
        .await;

        match framework.route(HAPPY_QUERY).await.unwrap() {
            RouteOutcome::Routed(result) => {
                assert_eq!(result.agent, "Cheerful");
                assert_eq!(result.result, "positive");
            }
            RouteOutcome::NoSuitableAgent => panic!("expected Cheerful to answer"),
        }

        let registrar = framework.registrar().clone();
        eventually(move || {
            let registrar = registrar.clone();
            async move { !registrar.history("Cheerful").await.is_empty() }
        })
        .await;
        framework.shutdown_all().await.unwrap();

        let persisted = JsonFileStore::beside(&registry_path).load_registry().unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted["Cheerful"].query_count, 1);
    }

    #[tokio::test]
    async fn test_empty_registrar_routes_nowhere() {
        let registrar = Registrar::open(
            RegistrarConfig::default(),
            Arc::new(mama::multi_agent::MemoryStore::new()),
            Arc::new(MarkupMatchStrategy::default()),
        )
        .unwrap();
        assert!(registrar.rank_agents(HAPPY_QUERY).await.unwrap().is_none());
        assert!(AgentProfileConfig::positive_classifier().validate().is_ok());
    }

    fn arb_record(name: String, sequence: u64) -> impl Strategy<Value = AgentRecord> {
        (
            prop::collection::btree_map("[a-z]{1,8}", -1e6f64..1e6, 0..5),
            any::<u16>(),
            -1e3f64..1e3,
            proptest::option::of("[ -~]{0,24}"),
            0u64..1000,
            0i64..4_000_000_000,
        )
            .prop_map(move |(weights, port, relevance, prompt, queries, secs)| {
                let at = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);
                AgentRecord {
                    name: name.clone(),
                    address: "127.0.0.1".into(),
                    port,
                    expertise_profile: weights.into(),
                    relevance,
                    specialty: None,
                    prompt,
                    sequence,
                    cumulative_relevance: relevance * queries as f64,
                    query_count: queries,
                    registered_at: at,
                    updated_at: at,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_relevance_is_monotonic_in_profile_weight(
            low in 0.0f64..10.0,
            delta in 0.0f64..10.0,
            markup_weight in 0.0f64..1.0,
            other in 0.0f64..1.0,
        ) {
            let markup: QueryMarkup = [("positive", markup_weight), ("negative", other)]
                .into_iter()
                .collect();
            let weaker = profile(low, 0.5);
            let stronger = profile(low + delta, 0.5);
            prop_assert!(markup_relevance(&stronger, &markup) >= markup_relevance(&weaker, &markup));
        }

        #[test]
        fn prop_save_then_load_is_identity(
            records in (0usize..4).prop_flat_map(|n| {
                (0..n)
                    .map(|i| arb_record(format!("agent-{i}"), i as u64))
                    .collect::<Vec<_>>()
            })
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = JsonFileStore::beside(dir.path().join("registry.json"));
            let table: RegistryTable = records.into_iter().map(|r| (r.name.clone(), r)).collect();

            store.save_registry(&table).unwrap();
            prop_assert_eq!(store.load_registry().unwrap(), table);
        }
    }
}
