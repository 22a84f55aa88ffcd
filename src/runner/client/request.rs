use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";
const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

#[derive(Debug, PartialEq, Clone)]
/// A json merge patch (RFC 7386) body
pub struct Patch {
    value: Value,
}

impl Patch {
    /// A merge patch that touches only `spec.ttlSecondsAfterFinished`. When a `resource_version`
    /// is given the api server rejects the patch with 409 Conflict if the object has been
    /// modified since that version.
    pub fn ttl_seconds_after_finished(ttl_seconds: i64, resource_version: Option<&str>) -> Patch {
        let mut value = serde_json::json!({
            "spec": {
                "ttlSecondsAfterFinished": ttl_seconds,
            }
        });
        if let Some(version) = resource_version {
            value["metadata"] = serde_json::json!({ "resourceVersion": version });
        }
        Patch { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Query parameters for a list request
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ListParams<'a> {
    pub namespace: Option<&'a str>,
    pub label_selector: Option<&'a str>,
    pub limit: Option<u32>,
    pub continue_token: Option<&'a str>,
}

pub fn patch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    patch: &Patch,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    let body = serde_json::to_vec(&patch.value)?;
    make_req(url, Method::PATCH, client_config)
        .header(header::CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
        .body(Body::from(body))
        .map_err(Into::into)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    params: &ListParams<'_>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, params.namespace, None)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(selector) = params.label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(limit) = params.limit {
            query.append_pair("limit", limit.to_string().as_str());
        }
        if let Some(token) = params.continue_token {
            query.append_pair("continue", token);
        }
    }
    // an empty query string would otherwise leave a trailing '?'
    if url.query() == Some("") {
        url.set_query(None);
    }
    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(String::from(url))
        .header(header::USER_AGENT, client_config.user_agent.as_str())
        .header(header::ACCEPT, "application/json");
    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
    }
    for group in client_config.impersonate_groups.iter() {
        builder = builder.header(IMPERSONATE_GROUP, group.as_str());
    }
    builder
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, Error> {
    let mut url = Url::parse(client_config.api_server_endpoint.as_str())
        .map_err(|e| Error::InvalidUrl(e.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidUrl(client_config.api_server_endpoint.clone()))?;
        // the endpoint may or may not have a trailing slash
        segments.pop_if_empty();

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}
