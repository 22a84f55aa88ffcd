use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// Just enough information about a Kubernetes resource type to build api server urls. Uses
/// `&'static str` everywhere so that types can be declared as statics:
///
/// ```no_run
/// use job_reaper::k8s_types::K8sType;
///
/// #[allow(non_upper_case_globals)]
/// pub static ScanJob: &K8sType = &K8sType {
///     api_version: "example.com/v1",
///     kind: "ScanJob",
///     plural_kind: "scanjobs",
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    /// Splits the apiVersion into group and version. Core types have an empty group.
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

pub mod batch {
    pub mod v1 {
        k8s_type!(Job, "batch/v1", "Job", "jobs");
    }
}
