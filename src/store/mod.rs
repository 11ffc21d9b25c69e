//! Client-side state stores.

pub mod crew;
pub mod execution;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;

pub use self::crew::{validate, Collection, CrewStore, Entity};
pub use self::execution::{ExecutionBundle, ExecutionStats, ExecutionStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("cannot apply changes to {kind} '{id}': {reason}")]
    Merge {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Api(e) if e.is_transport())
    }
}

/// What a network failure does to a mutating call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Return the transport error; nothing changes locally.
    #[default]
    Surface,
    /// Apply the change to local state only and report it as such.
    Local,
}

/// Where the data returned by a mutating call lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Remote,
    Local,
}

/// A value together with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Synced<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Synced<T> {
    pub fn remote(value: T) -> Self {
        Self {
            value,
            origin: Origin::Remote,
        }
    }

    pub fn local(value: T) -> Self {
        Self {
            value,
            origin: Origin::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}
