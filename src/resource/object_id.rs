use std::fmt::{self, Display};

/// Identifies a Job by `metadata.namespace` and `metadata.name`, which is all a patch needs.
/// Borrows from the `ManagedObject` or json it came from. A missing namespace is stored as an
/// empty string, and addresses the cluster-scoped url.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ObjectIdRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectIdRef<'a> {
    pub fn new(namespace: &'a str, name: &'a str) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }

    pub fn namespace(&self) -> Option<&'a str> {
        Some(self.namespace).filter(|ns| !ns.is_empty())
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn to_owned(&self) -> ObjectId {
        ObjectId::new(self.namespace, self.name)
    }
}

impl<'a> Display for ObjectIdRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(self.name),
        }
    }
}

/// Owned version of `ObjectIdRef`, for keeping ids around after the list they came from is gone
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn as_id_ref(&self) -> ObjectIdRef {
        ObjectIdRef::new(&self.namespace, &self.name)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_id_ref().fmt(f)
    }
}
