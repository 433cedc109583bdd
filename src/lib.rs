pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod secrets;
pub mod server;
pub mod web;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use server::TokenServer;
