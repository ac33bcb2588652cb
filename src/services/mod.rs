pub mod classification_dispatcher;
pub mod extractor;
pub mod key_router;
pub mod prompt_templates;
pub mod providers;
pub mod scoring_service;
pub mod settings_service;
pub mod sources;
