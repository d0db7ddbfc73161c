//! Error taxonomy of the external façade.
//!
//! Per-request transport failures are NOT here; they are recorded as
//! status-503 samples and never fail a run.

use thiserror::Error;

use crate::auth::AuthError;
use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    /// The request was malformed; nothing was started or changed.
    #[error("{0}")]
    Validation(String),

    /// A start was attempted while the active-run slot is occupied. The
    /// request is refused, never queued.
    #[error("A load test is already in progress")]
    RunInProgress,

    /// A project, endpoint or run lookup missed.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
