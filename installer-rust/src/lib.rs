pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fs_ops;
pub mod locale;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod package;
pub mod paths;
pub mod prompt;
pub mod record;
pub mod registration;
pub mod registry;
pub mod shortcuts;
pub mod tasks;
pub mod template;
