use crate::config::ConfigError;
use crate::resource::ManagedObject;

use lazy_static::lazy_static;
use regex::Regex;

/// Object names are at most this long (DNS subdomain)
const MAX_PREFIX_LEN: usize = 253;

lazy_static! {
    static ref PREFIX_REGEX: Regex = Regex::new("^[a-z0-9][-a-z0-9.]*$").unwrap();
}

/// Selects which jobs are subject to ttl enforcement. `matches` is pure and total: any object
/// that lacks the fields it needs simply doesn't match. That includes the namespace, since a
/// job without one can't be patched.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    prefix: String,
    only_finished: bool,
}

impl JobFilter {
    /// Returns an error if the prefix could never be the start of a valid object name
    pub fn new(prefix: impl Into<String>) -> Result<JobFilter, ConfigError> {
        let prefix = prefix.into();
        let reason = if prefix.is_empty() {
            Some("prefix must not be empty")
        } else if prefix.len() > MAX_PREFIX_LEN {
            Some("prefix must be at most 253 characters")
        } else if !PREFIX_REGEX.is_match(prefix.as_str()) {
            Some("prefix must start with a lowercase letter or digit and contain only lowercase letters, digits, '-' or '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ConfigError::InvalidPrefix { prefix, reason }),
            None => Ok(JobFilter {
                prefix,
                only_finished: false,
            }),
        }
    }

    /// When true, jobs without a `completionTime` are left alone
    pub fn only_finished(mut self, only_finished: bool) -> Self {
        self.only_finished = only_finished;
        self
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    pub fn matches(&self, object: &ManagedObject) -> bool {
        let name_matches = object
            .id()
            .map(|id| id.name().starts_with(self.prefix.as_str()))
            .unwrap_or(false);
        name_matches && (!self.only_finished || object.is_finished())
    }
}
