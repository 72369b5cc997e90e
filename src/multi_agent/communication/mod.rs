pub mod message;
pub mod transport;

pub use message::{QueryReply, QueryReport, QueryRequest, RegistrarMessage, RegistrationMessage};
pub use transport::{MessageListener, Transport, ephemeral_port};
