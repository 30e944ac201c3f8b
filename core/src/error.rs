use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TriageErr>;

#[derive(Error, Debug)]
pub enum TriageErr {
    /// Startup configuration problem. Fatal before serving.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("webhook dispatch failed: {0}")]
    Webhook(#[from] reqwest::Error),
}
