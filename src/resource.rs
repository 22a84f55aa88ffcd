mod json_ext;
mod object_id;

pub use self::json_ext::JobJson;
pub use self::object_id::{ObjectId, ObjectIdRef};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A Job as seen by the reaper. The cluster owns the object; the reaper only ever reads these
/// fields and narrows `ttl_seconds`. Every field is optional because the api server may hand us
/// partially populated objects, and those must never cause an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ManagedObject {
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// `metadata.resourceVersion` as of the list, sent back as a precondition when narrowing
    pub resource_version: Option<String>,
    /// `status.completionTime`, set once the job finishes
    pub completion_time: Option<DateTime<Utc>>,
    /// `spec.ttlSecondsAfterFinished`
    pub ttl_seconds: Option<i64>,
}

impl ManagedObject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ManagedObject {
        ManagedObject {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    pub fn with_completion_time(mut self, completion_time: DateTime<Utc>) -> Self {
        self.completion_time = Some(completion_time);
        self
    }

    /// Extracts the fields from a raw Job. Never fails: anything missing or malformed is `None`.
    pub fn from_value(value: &Value) -> ManagedObject {
        let completion_time = value.get_completion_time().and_then(|time| {
            match DateTime::parse_from_rfc3339(time) {
                Ok(parsed) => Some(parsed.with_timezone(&Utc)),
                Err(err) => {
                    log::debug!("Ignoring unparseable completionTime '{}': {}", time, err);
                    None
                }
            }
        });
        ManagedObject {
            namespace: value.get_namespace().map(str::to_owned),
            name: value.get_name().map(str::to_owned),
            resource_version: value.get_resource_version().map(str::to_owned),
            completion_time,
            ttl_seconds: value.get_ttl_seconds(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Returns None unless the object has both a name and a namespace. Jobs are namespaced, so
    /// anything less can't be addressed by the api.
    pub fn id(&self) -> Option<ObjectIdRef> {
        let namespace = self.namespace().filter(|ns| !ns.is_empty())?;
        let name = self.name()?;
        Some(ObjectIdRef::new(namespace, name))
    }

    pub fn is_finished(&self) -> bool {
        self.completion_time.is_some()
    }
}

impl std::fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.namespace().unwrap_or(""),
            self.name().unwrap_or("<unnamed>")
        )
    }
}
