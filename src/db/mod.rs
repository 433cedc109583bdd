pub mod models;
pub mod queries;

pub use models::{token_prefix, IssuedToken, NewToken, PendingToken, TokenRow};
pub use queries::{init_db, memory_pool, DbPool, TokenRepo, AGENT_TOKEN_TTL};

#[cfg(test)]
pub use queries::setup_test_db;
