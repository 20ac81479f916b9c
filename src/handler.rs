//! Handler seam between the proxy core and user code, plus the small
//! response helpers shared by the dispatcher and the hijacker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_TYPE};
use http::{Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

use crate::error::ProxyResult;

/// Boxed response body used throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Receives proxied requests. On the intercept path the request arrives
/// with a fully qualified `https://` URL reconstructed from the CONNECT
/// destination, so one handler serves both plain and decrypted traffic.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>>;
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = if message.is_empty() {
        empty_body()
    } else {
        full_body(format!("{message}\n"))
    };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .unwrap()
}

/// Appends every header from `src` onto `dst`, keeping duplicates.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name, value.clone());
    }
}

/// Serves a fixed byte blob on GET, such as the root certificate
/// download. Other methods get 405.
pub struct FileHandler {
    content_type: String,
    data: Bytes,
}

impl FileHandler {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl HttpHandler for FileHandler {
    async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
        if req.method() != Method::GET {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED, ""));
        }
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, self.content_type.as_str())
            .body(full_body(self.data.clone()))
            .unwrap())
    }
}

/// Exact-path router for requests addressed to the proxy itself.
#[derive(Default)]
pub struct LocalRouter {
    routes: HashMap<String, Arc<dyn HttpHandler>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn HttpHandler>) -> Self {
        self.routes.insert(path.into(), handler);
        self
    }
}

#[async_trait]
impl HttpHandler for LocalRouter {
    async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
        match self.routes.get(req.uri().path()) {
            Some(handler) => handler.handle(req).await,
            None => Ok(status_response(StatusCode::NOT_FOUND, "not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, SET_COOKIE};

    #[test]
    fn copy_headers_keeps_duplicates() {
        let mut src = HeaderMap::new();
        src.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        src.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        src.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let mut dst = HeaderMap::new();
        dst.insert(SET_COOKIE, HeaderValue::from_static("c=3"));
        copy_headers(&mut dst, &src);

        let cookies: Vec<_> = dst.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 3);
        assert_eq!(dst.get(CONTENT_TYPE).unwrap(), "text/plain");
    }
}
