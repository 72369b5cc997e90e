pub mod communication;
pub mod manager;
pub mod registry;

pub use communication::{
    MessageListener, QueryReply, QueryReport, QueryRequest, RegistrarMessage, RegistrationMessage,
    Transport,
};
pub use manager::{Framework, RouteOutcome, RouteResult};
pub use registry::{
    AgentRecord, AgentUpdate, JsonFileStore, MemoryStore, RankedAgent, Registrar, RegistryStore,
};
