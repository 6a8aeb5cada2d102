//! Kubernetes-backed implementations of the migrator's collaborators

mod discovery;
mod progress_store;
mod resource_client;

pub use discovery::*;
pub use progress_store::*;
pub use resource_client::*;

use crate::migrator::ApiError;

/// Convert a kube client error for classification
pub(crate) fn api_error(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(response) => {
            let reason = Some(response.reason.as_str()).filter(|r| !r.is_empty());
            ApiError::from_status(response.code, reason, response.message)
        }
        other => ApiError::from_transport(other),
    }
}
