//! `Page` route registration: the extension point that lets a caller attach a pipeline-backed
//! handler to a path before `Server::with_settings` binds the listener. Without this, `Page` and
//! `pipeline::execute` have no caller outside their own unit tests (§4.F/§4.H/§4.I).
use std::sync::Arc;

use apphost_client::HttpClientCore;

use crate::pipeline::{HttpMethod, Page};

/// Builds a fresh `Page` instance for one inbound request, given the shared HTTP client. Returns
/// `Box<dyn Page>` rather than a generic since a single registry holds routes for unrelated
/// concrete handler types; must be `Send + Sync` because it's captured by the `HttpServer::new`
/// app factory closure, which actix-web clones onto every worker thread (the `Page` it produces
/// runs entirely within one worker's local executor and need not itself be `Send`).
pub type PageFactory = Arc<dyn Fn(Arc<HttpClientCore>) -> Box<dyn Page> + Send + Sync>;

#[derive(Clone)]
pub struct PageRoute {
    pub path: String,
    pub methods: Vec<HttpMethod>,
    pub handler_name: &'static str,
    pub factory: PageFactory,
}

/// The set of `Page` routes a caller registers before `.bind()`, mirroring the style of
/// `IntegrationRegistry`/`RendererRegistry`: an explicit list built at startup rather than
/// decorator- or attribute-based discovery.
#[derive(Clone, Default)]
pub struct PageRegistry {
    routes: Vec<PageRoute>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, route: PageRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageRoute> {
        self.routes.iter()
    }
}

pub(super) fn to_actix_method(method: HttpMethod) -> actix_web::http::Method {
    match method {
        HttpMethod::Get => actix_web::http::Method::GET,
        HttpMethod::Head => actix_web::http::Method::HEAD,
        HttpMethod::Post => actix_web::http::Method::POST,
        HttpMethod::Put => actix_web::http::Method::PUT,
        HttpMethod::Delete => actix_web::http::Method::DELETE,
    }
}

pub(super) fn from_actix_method(method: &actix_web::http::Method) -> Option<HttpMethod> {
    match *method {
        actix_web::http::Method::GET => Some(HttpMethod::Get),
        actix_web::http::Method::HEAD => Some(HttpMethod::Head),
        actix_web::http::Method::POST => Some(HttpMethod::Post),
        actix_web::http::Method::PUT => Some(HttpMethod::Put),
        actix_web::http::Method::DELETE => Some(HttpMethod::Delete),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_actix_method() {
        for method in [
            HttpMethod::Get,
            HttpMethod::Head,
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Delete,
        ] {
            assert_eq!(from_actix_method(&to_actix_method(method)), Some(method));
        }
    }

    #[test]
    fn registry_preserves_registration_order() {
        let factory: PageFactory = Arc::new(|_client| unimplemented!());
        let registry = PageRegistry::new()
            .register(PageRoute {
                path: "/a/".to_owned(),
                methods: vec![HttpMethod::Get],
                handler_name: "a",
                factory: factory.clone(),
            })
            .register(PageRoute {
                path: "/b/".to_owned(),
                methods: vec![HttpMethod::Get],
                handler_name: "b",
                factory,
            });
        let names: Vec<_> = registry.iter().map(|r| r.handler_name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
