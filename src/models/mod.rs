pub mod audit;
pub mod classification;
pub mod credential;
pub mod evaluation;
pub mod settings;
