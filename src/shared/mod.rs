pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{
    AgentProfileConfig, AgentRuntimeConfig, BackoffKind, LoggingConfig, MamaConfig,
    RankingStrategyKind, RegistrarConfig, SemanticConfig, TransportConfig,
    load_agent_profile, load_agent_profiles,
};
pub use logging::init_logging;
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};
