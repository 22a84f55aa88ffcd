use crate::k8s_types::K8sType;
use crate::resource::ManagedObject;
use crate::runner::client::{Client, Error, ListParams};

use async_trait::async_trait;

use std::sync::Arc;

/// The read side of the api. Every call is a fresh, full snapshot: no ordering is guaranteed and
/// nothing is carried over from one call to the next. An empty result is not an error. Errors are
/// returned as is, without any retries.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list(&self, kind: &K8sType) -> Result<Vec<ManagedObject>, Error>;
}

#[async_trait]
impl<T: ResourceLister + ?Sized> ResourceLister for Arc<T> {
    async fn list(&self, kind: &K8sType) -> Result<Vec<ManagedObject>, Error> {
        (**self).list(kind).await
    }
}

/// Restricts what a `ClusterLister` looks at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListScope {
    /// `None` lists across all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    /// When set, pages of this size are requested until the api server stops returning a
    /// `continue` token
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClusterLister {
    client: Client,
    scope: ListScope,
}

impl ClusterLister {
    pub fn new(client: Client, scope: ListScope) -> ClusterLister {
        ClusterLister { client, scope }
    }
}

#[async_trait]
impl ResourceLister for ClusterLister {
    async fn list(&self, kind: &K8sType) -> Result<Vec<ManagedObject>, Error> {
        let mut objects = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let params = ListParams {
                namespace: self.scope.namespace.as_deref(),
                label_selector: self.scope.label_selector.as_deref(),
                limit: self.scope.page_size,
                continue_token: continue_token.as_deref(),
            };
            let page = self.client.list_page(kind, &params).await?;
            pages += 1;
            objects.extend(page.items.iter().map(ManagedObject::from_value));

            match page.metadata.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        log::debug!(
            "Listed {} {} in {} page(s), namespace: {}",
            objects.len(),
            kind,
            pages,
            self.scope.namespace.as_deref().unwrap_or("<all>")
        );
        Ok(objects)
    }
}
