// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

use crate::receivers::dir::watcher::WatcherError;
use crate::topic_config::ConfigError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid watch request: {0}")]
    InvalidWatch(String),

    #[error("Directory already watched: {0}")]
    AlreadyWatched(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),
}

pub type Result<T> = std::result::Result<T, Error>;
