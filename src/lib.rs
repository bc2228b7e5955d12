pub mod logging;

pub mod api;
pub mod auth;
pub mod backlinks;
pub mod card_service;
pub mod config;
pub mod database;
pub mod errors;
pub mod file_service;
pub mod file_storage;
pub mod models;

pub use api::{create_router, AppState};
pub use auth::TokenSigner;
pub use card_service::CardService;
pub use config::Config;
pub use database::Database;
pub use errors::*;
pub use file_service::FileService;
pub use file_storage::{FilesystemBackend, StorageBackend};
pub use models::*;
