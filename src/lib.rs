pub mod app_state;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use app_state::AppState;
pub use error::{AppError, AppResult, ProviderErrorCode};
pub use services::classification_dispatcher::ClassificationDispatcher;
pub use services::key_router::KeyRouter;
pub use services::scoring_service::ScoringService;
