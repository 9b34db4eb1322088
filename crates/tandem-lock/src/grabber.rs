//! Read/write lock grab strategy

use serde::{Deserialize, Serialize};

use crate::manager::{LockClient, LockError};
use crate::model::{LockMode, LockableResource};

/// Selects read or write acquisition for every resource of a lock call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockGrabber {
    Read,
    Write,
}

impl LockGrabber {
    pub fn mode(self) -> LockMode {
        match self {
            LockGrabber::Read => LockMode::Shared,
            LockGrabber::Write => LockMode::Exclusive,
        }
    }

    pub async fn grab(
        self,
        client: &dyn LockClient,
        resource: &LockableResource,
    ) -> Result<(), LockError> {
        match self {
            LockGrabber::Read => client.acquire_shared(resource).await,
            LockGrabber::Write => client.acquire_exclusive(resource).await,
        }
    }
}
