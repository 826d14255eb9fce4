#![recursion_limit = "256"]

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod inference;
pub mod logger;
pub mod metrics;
pub mod optim;
pub mod scoring;
pub mod training;
pub mod transformer;
pub mod vocabulary;

pub use error::{Result, TranslatorError};
