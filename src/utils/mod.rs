pub mod crypto;
pub mod logger;
pub mod redact;
pub mod score_combinator;
