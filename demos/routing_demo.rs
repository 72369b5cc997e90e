//! Starts a registrar with the two built-in sentiment agents and routes a few queries.
//!
//! ```text
//! cargo run --example routing_demo [config.yaml]
//! ```

use mama::{
    Framework, MamaConfig, RouteOutcome, init_logging,
    shared::config::AgentProfileConfig,
};
use tracing::info;

#[tokio::main]
async fn main() -> mama::Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => MamaConfig::load(path)?,
        None => MamaConfig::default(),
    };
    init_logging(&config.logging);

    if config.agents.is_empty() {
        config.agents = vec![
            AgentProfileConfig::positive_classifier(),
            AgentProfileConfig::negative_classifier(),
        ];
    }

    let framework = Framework::start_with_agents(config).await?;
    // Registrations travel over TCP; give the registrar a moment to take them in.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    for query in [
        "I love this, it's great and good",
        "what a bad, sad afternoon",
        "oh sure, I am not happy at all",
        "",
    ] {
        match framework.route(query).await? {
            RouteOutcome::Routed(result) => info!(
                "'{}' -> {} says {} (relevance {:.2}, popularity {:.2})",
                query, result.agent, result.result, result.relevance, result.popularity
            ),
            RouteOutcome::NoSuitableAgent => info!("'{}' -> no suitable agent", query),
        }
    }

    for record in framework.registrar().list_agents().await {
        info!(
            "{} served {} quer(ies), popularity {:.2}",
            record.name,
            record.query_count,
            record.popularity()
        );
    }

    framework.shutdown_all().await
}
