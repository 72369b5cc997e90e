pub mod agent;
pub mod error;
pub mod multi_agent;
pub mod shared;
pub mod utils;

pub use agent::{Agent, CapabilityProfile};
pub use error::{Error, Result};
pub use multi_agent::{Framework, Registrar, RouteOutcome, RouteResult};
pub use shared::{MamaConfig, init_logging};
