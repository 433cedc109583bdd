pub mod routes;
pub mod templates;

pub use routes::{
    admin_router, create_router, public_router, with_tracing, AppState,
    AGENT_ID_HEADER,
};
