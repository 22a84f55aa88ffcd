use crate::k8s_types::K8sType;
use crate::resource::{ManagedObject, ObjectIdRef};
use crate::runner::client::{Client, Error, Patch};

use async_trait::async_trait;

use std::sync::Arc;

/// The write side of the api: sets `spec.ttlSecondsAfterFinished` on a single object using a
/// merge patch, leaving every other field alone. A `resource_version` makes the patch
/// conditional, so that it fails with 409 Conflict if the object changed since it was listed.
#[async_trait]
pub trait TtlPatch: Send + Sync {
    async fn patch_ttl(
        &self,
        kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error>;
}

#[async_trait]
impl TtlPatch for Client {
    async fn patch_ttl(
        &self,
        kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error> {
        let patch = Patch::ttl_seconds_after_finished(ttl_seconds, resource_version);
        self.patch_resource(kind, id, &patch).await
    }
}

#[async_trait]
impl<T: TtlPatch + ?Sized> TtlPatch for Arc<T> {
    async fn patch_ttl(
        &self,
        kind: &K8sType,
        id: &ObjectIdRef<'_>,
        ttl_seconds: i64,
        resource_version: Option<&str>,
    ) -> Result<(), Error> {
        (**self)
            .patch_ttl(kind, id, ttl_seconds, resource_version)
            .await
    }
}

/// Decides whether an existing ttl may be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchPolicy {
    /// Steady state enforcement. The ttl may only ever go down, so objects that already have a
    /// ttl at or below the target are left alone without calling the api. The patch is made
    /// conditional on the listed resourceVersion, so a ttl lowered after the list is never raised.
    Narrow,
    /// Forced cleanup. The patch is always sent.
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// The object already had an equal or lower ttl, or changed since it was listed
    Unchanged,
    /// The object was deleted between list and patch, which is as good as done
    NotFound,
    /// The object has no name or namespace, so it can't be addressed
    Skipped,
}

impl PatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchOutcome::Applied => "applied",
            PatchOutcome::Unchanged => "unchanged",
            PatchOutcome::NotFound => "not_found",
            PatchOutcome::Skipped => "skipped",
        }
    }
}

/// Returns the ttl to send, or None if the object should be left as is
pub fn target_ttl(current: Option<i64>, desired: i64, policy: PatchPolicy) -> Option<i64> {
    match (policy, current) {
        (PatchPolicy::Override, _) => Some(desired),
        (PatchPolicy::Narrow, Some(current)) if current <= desired => None,
        (PatchPolicy::Narrow, _) => Some(desired),
    }
}

#[derive(Debug)]
pub struct TtlPatcher<P> {
    api: P,
    kind: &'static K8sType,
}

impl<P: TtlPatch> TtlPatcher<P> {
    pub fn new(api: P, kind: &'static K8sType) -> TtlPatcher<P> {
        TtlPatcher { api, kind }
    }

    /// Applies `ttl_seconds` to the object according to the policy. Only unexpected api errors
    /// are returned; a missing object is reported as `NotFound`, and a narrowing patch that lost
    /// a race with another writer as `Unchanged`.
    pub async fn patch(
        &self,
        object: &ManagedObject,
        ttl_seconds: i64,
        policy: PatchPolicy,
    ) -> Result<PatchOutcome, Error> {
        let id = match object.id() {
            Some(id) => id,
            None => {
                log::warn!("Skipping {} '{}' with no name or namespace", self.kind.kind, object);
                return Ok(PatchOutcome::Skipped);
            }
        };
        let ttl = match target_ttl(object.ttl_seconds, ttl_seconds, policy) {
            Some(ttl) => ttl,
            None => {
                log::debug!(
                    "{} '{}' already has ttl: {:?} <= {}, leaving it alone",
                    self.kind.kind,
                    id,
                    object.ttl_seconds,
                    ttl_seconds
                );
                return Ok(PatchOutcome::Unchanged);
            }
        };

        let precondition = match policy {
            PatchPolicy::Narrow => object.resource_version(),
            PatchPolicy::Override => None,
        };
        match self.api.patch_ttl(self.kind, &id, ttl, precondition).await {
            Ok(()) => {
                log::info!(
                    "Set ttlSecondsAfterFinished on {} '{}' from {:?} to {}",
                    self.kind.kind,
                    id,
                    object.ttl_seconds,
                    ttl
                );
                Ok(PatchOutcome::Applied)
            }
            Err(ref err) if err.is_not_found() => {
                log::info!(
                    "{} '{}' no longer exists, nothing to patch",
                    self.kind.kind,
                    id
                );
                Ok(PatchOutcome::NotFound)
            }
            Err(ref err) if precondition.is_some() && err.is_conflict() => {
                log::info!(
                    "{} '{}' was modified since resourceVersion: {:?}, leaving it for the next cycle",
                    self.kind.kind,
                    id,
                    precondition
                );
                Ok(PatchOutcome::Unchanged)
            }
            Err(err) => Err(err),
        }
    }
}
