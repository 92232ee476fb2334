mod model;
mod state;

pub use model::*;
pub use state::RoutingMatrix;
