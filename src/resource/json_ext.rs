use serde_json::Value;

pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";
pub static RESOURCE_VERSION_POINTER: &str = "/metadata/resourceVersion";
pub static COMPLETION_TIME_POINTER: &str = "/status/completionTime";
pub static TTL_SECONDS_POINTER: &str = "/spec/ttlSecondsAfterFinished";

/// Lenient accessors for the handful of Job fields the reaper cares about. Every accessor
/// returns `None` when the field is missing or has the wrong json type.
pub trait JobJson {
    fn get_namespace(&self) -> Option<&str>;
    fn get_name(&self) -> Option<&str>;
    fn get_resource_version(&self) -> Option<&str>;
    fn get_completion_time(&self) -> Option<&str>;
    fn get_ttl_seconds(&self) -> Option<i64>;
}

fn str_value<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl JobJson for Value {
    fn get_namespace(&self) -> Option<&str> {
        str_value(self, NAMESPACE_POINTER)
    }

    fn get_name(&self) -> Option<&str> {
        str_value(self, NAME_POINTER)
    }

    fn get_resource_version(&self) -> Option<&str> {
        str_value(self, RESOURCE_VERSION_POINTER)
    }

    fn get_completion_time(&self) -> Option<&str> {
        str_value(self, COMPLETION_TIME_POINTER)
    }

    fn get_ttl_seconds(&self) -> Option<i64> {
        self.pointer(TTL_SECONDS_POINTER).and_then(Value::as_i64)
    }
}
