//! Container runtime interface and mock implementation.
//!
//! The runtime interface is the narrow slice of the CRI the pipeline needs:
//! - Listing images and containers
//! - Deleting an image by id
//!
//! A mock implementation is provided for testing.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use imgsweep_reconcile::{ContainerRecord, ImageRecord};
use thiserror::Error;
use tracing::{debug, info};

use crate::endpoint::EndpointError;
use crate::grpc_client::ApiVersion;

/// One failed `Version` probe during negotiation.
#[derive(Debug)]
pub struct ProbeFailure {
    pub version: ApiVersion,
    pub status: tonic::Status,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({:?})",
            self.version,
            self.status.message(),
            self.status.code()
        )
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime endpoint")]
    Endpoint(#[from] EndpointError),

    #[error("failed to connect to runtime at {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// Neither API version answered `Version`.
    #[error("runtime speaks no supported CRI version: {}", join_failures(.failures))]
    Negotiation { failures: Vec<ProbeFailure> },

    /// The runtime answered a call with an error status.
    #[error("{call} failed: {}", .status.message())]
    Rpc {
        call: &'static str,
        #[source]
        status: tonic::Status,
    },

    #[error("runtime I/O error")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn rpc(call: &'static str, status: tonic::Status) -> Self {
        Self::Rpc { call, status }
    }

    /// True if the runtime itself refused the call. Anything else (I/O,
    /// connection setup) is unexpected from the removal engine's point of
    /// view.
    pub fn is_runtime_refusal(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rpc { status, .. } if status.code() == tonic::Code::NotFound)
    }
}

fn join_failures(failures: &[ProbeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Image runtime interface.
///
/// `delete_image` is idempotent: an empty id is a no-op and an id the
/// runtime no longer knows counts as deleted.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Every image in the node's store.
    async fn list_images(&self) -> Result<Vec<ImageRecord>, RuntimeError>;

    /// Every container, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Remove one image by id.
    async fn delete_image(&self, id: &str) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Copy)]
enum InjectedFailure {
    /// The runtime refuses the delete.
    Refuse,
    /// The call fails below the RPC layer.
    Io,
}

#[derive(Debug, Default)]
struct MockState {
    images: Vec<ImageRecord>,
    containers: Vec<ContainerRecord>,
    failures: HashMap<String, InjectedFailure>,
    /// Ids actually removed, in call order.
    deleted: Vec<String>,
    delete_calls: usize,
}

/// In-memory runtime for testing.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create a mock runtime holding the given images and containers.
    pub fn new(images: Vec<ImageRecord>, containers: Vec<ContainerRecord>) -> Self {
        Self {
            state: Mutex::new(MockState {
                images,
                containers,
                ..MockState::default()
            }),
        }
    }

    /// Make deletes of `id` fail with a runtime error status.
    pub fn with_delete_failure(self, id: impl Into<String>) -> Self {
        self.inject(id.into(), InjectedFailure::Refuse)
    }

    /// Make deletes of `id` fail with an I/O error.
    pub fn with_io_failure(self, id: impl Into<String>) -> Self {
        self.inject(id.into(), InjectedFailure::Io)
    }

    fn inject(self, id: String, failure: InjectedFailure) -> Self {
        self.lock().failures.insert(id, failure);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids removed so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Number of `delete_image` calls, including no-ops and failures.
    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    /// Ids still present.
    pub fn remaining(&self) -> BTreeSet<String> {
        self.lock().images.iter().map(|i| i.id.clone()).collect()
    }
}

#[async_trait]
impl ImageRuntime for MockRuntime {
    async fn list_images(&self) -> Result<Vec<ImageRecord>, RuntimeError> {
        let images = self.lock().images.clone();
        debug!(count = images.len(), "[MOCK] Listing images");
        Ok(images)
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let containers = self.lock().containers.clone();
        debug!(count = containers.len(), "[MOCK] Listing containers");
        Ok(containers)
    }

    async fn delete_image(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.delete_calls += 1;

        if id.is_empty() {
            return Ok(());
        }

        match state.failures.get(id) {
            Some(InjectedFailure::Refuse) => {
                return Err(RuntimeError::rpc(
                    "RemoveImage",
                    tonic::Status::failed_precondition(format!("image {id} is in use")),
                ));
            }
            Some(InjectedFailure::Io) => {
                return Err(RuntimeError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "runtime socket closed",
                )));
            }
            None => {}
        }

        let before = state.images.len();
        state.images.retain(|image| image.id != id);
        if state.images.len() < before {
            info!(image_id = %id, "[MOCK] Removed image");
            state.deleted.push(id.to_string());
        } else {
            debug!(image_id = %id, "[MOCK] Image already absent");
        }

        Ok(())
    }
}
