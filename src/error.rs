use std::any::Any;

/// Trait for errors that may be returned from the reaper entry points. This just sets up the
/// trait bounds that are required, since we'll typically only expose rather opaque boxed
/// error types, and they will need to be sent between threads.
pub trait ReaperError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> ReaperError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn ReaperError>;

impl dyn ReaperError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: ReaperError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: ReaperError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: ReaperError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}
