/// Request/response interceptor chain.
///
/// Interceptors run on every HTTP exchange, retries included. Request hooks
/// may mutate headers before the request is built. Response hooks see the
/// status and headers (never the body) and may set `replay_request` to have
/// the whole call reissued within the retry budget. Cookie-refresh style
/// interceptors use that to recover from a 401.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

/// Mutable view of an outgoing request.
#[derive(Debug)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    /// 1-based attempt counter, counting retries and replays.
    pub attempt: u32,
}

/// Immutable view of a response, before its body has been consumed.
#[derive(Debug)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Set to reissue the whole call. Counts against the retry budget.
    pub replay_request: bool,
}

pub trait HttpInterceptor: Send + Sync {
    fn intercept_request(&self, _ctx: &mut RequestContext) {}
    fn intercept_response(&self, _ctx: &mut ResponseContext) {}
}

/// Adds an `Authorization: Basic` header to every request.
pub struct BasicAuthInterceptor {
    header: HeaderValue,
}

impl BasicAuthInterceptor {
    pub fn new(username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let mut header = HeaderValue::from_str(&format!("Basic {encoded}"))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        header.set_sensitive(true);
        BasicAuthInterceptor { header }
    }
}

impl HttpInterceptor for BasicAuthInterceptor {
    fn intercept_request(&self, ctx: &mut RequestContext) {
        ctx.headers.insert(AUTHORIZATION, self.header.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_sets_header() {
        let interceptor = BasicAuthInterceptor::new("admin", "password");
        let mut ctx = RequestContext {
            method: "GET".into(),
            url: "http://example/db".into(),
            headers: HeaderMap::new(),
            attempt: 1,
        };
        interceptor.intercept_request(&mut ctx);

        let value = ctx.headers.get(AUTHORIZATION).unwrap();
        // "admin:password" base64
        assert_eq!(value.to_str().unwrap(), "Basic YWRtaW46cGFzc3dvcmQ=");
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Nothing;
        impl HttpInterceptor for Nothing {}

        let mut ctx = ResponseContext {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            replay_request: false,
        };
        Nothing.intercept_response(&mut ctx);
        assert!(!ctx.replay_request);
    }
}
