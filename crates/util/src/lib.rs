//! File-backed collaborators for the regflow engine.
//!
//! The engine only knows the [`regflow_engine::ConfigurationSource`],
//! [`regflow_engine::DataExtractor`], and [`regflow_engine::ReportRenderer`] traits. This crate
//! implements them over a configuration directory, JSON row files, and JSON artifacts, and reads
//! the settings that tie them together from the environment.

pub mod config_source;
pub mod extract;
pub mod render;
pub mod settings;

pub use config_source::DirectoryConfigSource;
pub use extract::JsonFileExtractor;
pub use render::JsonFileRenderer;
pub use settings::{EngineSettings, SettingsError, expand_tilde};
