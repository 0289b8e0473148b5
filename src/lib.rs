use thiserror::Error;

pub mod abuse;
pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod logs;
pub mod matchmaking;
pub mod persistence;
pub mod protocol;
pub mod rating;
pub mod util;

/// Opaque, upstream-verified player identity. The server never issues or
/// checks credentials; `Hello` carries an id the platform already trusts.
pub type PlayerId = String;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("rule violation: {0}")]
    RuleViolation(#[from] domino_core::MatchError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not possible: {0}")]
    NotPossible(String),

    #[error("player suspended: {0}")]
    Suspended(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation<T, R>(msg: T) -> ServiceResult<R>
    where
        T: Into<String>,
    {
        Err(ServiceError::Validation(msg.into()))
    }

    pub fn not_found<T, R>(msg: T) -> ServiceResult<R>
    where
        T: Into<String>,
    {
        Err(ServiceError::NotFound(msg.into()))
    }

    pub fn not_possible<T, R>(msg: T) -> ServiceResult<R>
    where
        T: Into<String>,
    {
        Err(ServiceError::NotPossible(msg.into()))
    }

    pub fn suspended<T, R>(msg: T) -> ServiceResult<R>
    where
        T: Into<String>,
    {
        Err(ServiceError::Suspended(msg.into()))
    }

    pub fn internal<T, R>(msg: T) -> ServiceResult<R>
    where
        T: Into<String>,
    {
        Err(ServiceError::Internal(msg.into()))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
