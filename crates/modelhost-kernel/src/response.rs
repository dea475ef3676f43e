//! The `success` / `data` / `error` envelope returned at every public call boundary.

use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl<T> ServiceResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ServiceError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Failure that still carries partial data (e.g. a registration kept in a
    /// not-loaded state after worker creation failed).
    pub fn partial(data: T, error: ServiceError) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Convert back into a `Result`, discarding partial data on failure.
    pub fn into_result(self) -> ServiceResult<T> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(ServiceError::internal("response carried neither data nor error")),
        }
    }
}

impl<T> From<ServiceResult<T>> for ServiceResponse<T> {
    fn from(result: ServiceResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(error),
        }
    }
}
