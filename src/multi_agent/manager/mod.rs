pub mod framework;

pub use framework::{Framework, RouteOutcome, RouteResult};
