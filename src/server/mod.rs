pub mod router;
pub mod sessions;
pub mod state;

pub use router::build_router;
pub use state::ServeState;
