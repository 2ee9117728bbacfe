use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        }
    }
}

/// One outgoing call: endpoint, query parameters and an optional JSON body.
///
/// Parameters are kept in a sorted map so keys are unique and the rendered
/// query string is stable.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub method: Method,
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl PendingRequest {
    pub fn get<I, K, V>(endpoint: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            params: collect_params(params),
            body: None,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn post_with_params<I, K, V>(endpoint: impl Into<String>, params: I, body: Value) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            params: collect_params(params),
            body: Some(body),
        }
    }
}

// Later pairs overwrite earlier ones with the same key.
fn collect_params<I, K, V>(params: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
