//! Per-request context handed through the middleware chain to the handler.
//!
//! A [`Context`] owns the parsed [`Request`], the path [`Parameters`] captured by the
//! matched route and a type-keyed [`Extensions`] map middleware can use to pass state
//! (an authenticated user, a request id) down to handlers without coupling them.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use crate::Request;

/// Request-scoped values keyed by their type, at most one per type.
#[derive(Default)]
pub struct Extensions {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.values.len())
            .finish()
    }
}

fn unbox<T: 'static>(value: Box<dyn Any + Send + Sync>) -> Option<T> {
    value.downcast::<T>().ok().map(|boxed| *boxed)
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, handing back whatever value of the same type it replaced.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(unbox)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.values.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values.remove(&TypeId::of::<T>()).and_then(unbox)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Path parameters extracted from the matched route, already percent-decoded.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Everything a handler needs to know about one request.
#[derive(Debug)]
pub struct Context {
    request: Request,
    params: Parameters,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            params: Parameters::new(),
            extensions: Extensions::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    /// Splits the context into the request and its path parameters.
    pub fn into_parts(self) -> (Request, Parameters) {
        (self.request, self.params)
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// A path parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// A query-string parameter by name.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query_param(name)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        self.request.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[derive(Debug, PartialEq)]
    struct UserId(u32);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(UserId(1)).is_none());
        assert_eq!(ext.insert(UserId(2)), Some(UserId(1)));
        ext.insert("label");
        assert_eq!(ext.len(), 2);
        assert_eq!(ext.get::<UserId>(), Some(&UserId(2)));
        ext.get_mut::<UserId>().unwrap().0 = 7;
        assert_eq!(ext.remove::<UserId>(), Some(UserId(7)));
        assert!(!ext.contains::<UserId>());
    }

    #[test]
    fn params_and_query() {
        let request = Request::new(Method::Get, "/users/42?tab=posts");
        let params: Parameters = [("id", "42")].into_iter().collect();
        let ctx = Context::new(request).with_params(params);
        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.param("missing"), None);
        assert_eq!(ctx.query("tab"), Some("posts"));
    }

    #[test]
    fn json_body() {
        let request = Request::new(Method::Post, "/").with_body(r#"{"name":"kiln"}"#);
        let ctx = Context::new(request);
        let value: serde_json::Value = ctx.json().unwrap();
        assert_eq!(value["name"], "kiln");
    }
}
