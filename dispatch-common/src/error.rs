use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur while the engine is running. Per the spec, none of these
/// ever escape to an external caller: each is logged and handled locally (skip the
/// item, abort the phase, or exit the worker) at the point it is produced.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("store call failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur during construction, before anything is running.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(String),
}
