//! actix-web wiring: the two built-in endpoints (§6 `GET /version/`, `GET /status/`), the
//! Dockerflow operational endpoints **(ADDED)**, the `X-Request-Id` echo, CORS, and the
//! `Server::with_settings` entry point. Grounded on `syncserver::server::mod` (`ServerState`,
//! `build_cors`, `Server::with_settings`) and `frontik/app.py` (`VersionHandler`, `StatusHandler`,
//! `find_handler`'s request-id assignment).
pub mod debug;
pub mod routes;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::http::{header::HeaderValue, Method, StatusCode};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use apphost_client::HttpClientCore;
use apphost_common::middleware::sentry::SentryWrapper;
use cadence::StatsdClient;
use futures_util::future::LocalBoxFuture;
use serde::Serialize;

use crate::context::{next_request_id, RequestContext, RequestSummary};
use crate::error::{ApiError, ApiErrorKind};
use crate::integration::{AppHooks, IntegrationRegistry};
use crate::limiter::ActiveHandlerLimiter;
use crate::pipeline::{self, PipelineState};
use routes::{from_actix_method, to_actix_method, PageRegistry, PageRoute};

/// Remember to keep this in sync with the routes registered below (mirrors
/// `syncserver::server::DOCKER_FLOW_ENDPOINTS`'s own comment-as-checklist).
pub const DOCKER_FLOW_ENDPOINTS: &[&str] = &["/__heartbeat__", "/__lbheartbeat__", "/version/", "/status/"];

pub struct AppState {
    pub settings: apphost_settings::Settings,
    pub metrics: Arc<StatsdClient>,
    pub http_client: Arc<HttpClientCore>,
    pub limiter: ActiveHandlerLimiter,
    pub hooks: AppHooks,
    pub started_at: String,
}

pub struct Server;

impl Server {
    /// `pages` is the builder hook mentioned in §4.F/§4.H: every registered route is mounted
    /// behind the real admission path (limiter gate → debug-mode check → `pipeline::execute` →
    /// renderer) before the listener binds, so a caller can wire in its own `Page`s without
    /// reaching into an already-running server.
    pub async fn with_settings(
        settings: apphost_settings::Settings,
        integrations: IntegrationRegistry,
        pages: PageRegistry,
    ) -> Result<actix_web::dev::Server, ApiError> {
        integrations.initialize_all().await?;

        let metrics = apphost_common::metrics_from_opts(
            "apphost",
            settings.statsd_host.as_deref(),
            settings.statsd_port,
        )
        .map_err(|e| ApiErrorKind::Internal(e.to_string()))?;

        let http_client = apphost_client::build_http_client_core(&settings)
            .await
            .map_err(|e| ApiErrorKind::Internal(e.to_string()))?;

        let limiter = ActiveHandlerLimiter::new(settings.max_active_handlers);
        let host = settings.host.clone();
        let port = settings.port;
        let reuse_port = settings.reuse_port;
        let started_at = chrono::Utc::now().to_rfc3339();

        let state = Arc::new(AppState {
            settings: settings.clone(),
            metrics: metrics.clone(),
            http_client: Arc::new(http_client),
            limiter,
            hooks: AppHooks::default(),
            started_at,
        });

        let cors_settings = settings.clone();
        let mut http_server = HttpServer::new(move || {
            let mut app = App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(SentryWrapper::<ApiError>::new(metrics.clone()))
                .wrap_fn(assign_request_id)
                .wrap(build_cors(&cors_settings))
                .service(web::resource("/version/").route(web::get().to(version)))
                .service(web::resource("/status/").route(web::get().to(status)))
                .service(web::resource("/__heartbeat__").route(web::get().to(heartbeat)))
                .service(web::resource("/__lbheartbeat__").route(web::get().to(lbheartbeat)));

            for route in pages.iter() {
                let mut resource = web::resource(route.path.clone());
                for &method in &route.methods {
                    resource = resource.route(web::method(to_actix_method(method)).to(page_handler(route.clone())));
                }
                app = app.service(resource);
            }

            app
        });

        if reuse_port {
            http_server = http_server.backlog(1024);
        }

        // §6 "On SIGTERM, stop accepting new connections, wait up to `stop_timeout` seconds for
        // inflight handlers, then exit": actix-web's own SIGINT/SIGTERM handling already does
        // exactly this once `shutdown_timeout` is set, so main.rs doesn't need its own signal
        // plumbing.
        http_server = http_server.shutdown_timeout(settings.stop_timeout);

        let bound = http_server
            .bind(format!("{}:{}", host, port))
            .map_err(|e| ApiErrorKind::Internal(e.to_string()))?;

        Ok(bound.run())
    }
}

/// Echo the inbound `x-request-id`, or assign one, onto the response (§6).
fn assign_request_id<S, B>(
    req: ServiceRequest,
    srv: &S,
) -> impl std::future::Future<Output = Result<ServiceResponse<B>, actix_web::Error>>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
{
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(next_request_id);

    let fut = srv.call(req);
    async move {
        let mut res = fut.await?;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            res.headers_mut().insert(
                actix_web::http::header::HeaderName::from_static("x-request-id"),
                value,
            );
        }
        Ok(res)
    }
}

/// Build the actix-web handler for one registered `Page` route: admit through the active-handler
/// limiter, gate on the debug-mode credential check, run the pipeline, and translate its
/// `PipelineOutcome` into an `HttpResponse` (§4.F/§4.H/§4.I, the admission path `Page`/
/// `pipeline::execute`/`ActiveHandlerLimiter::try_admit`/`server::debug` otherwise have no caller
/// for).
fn page_handler(
    route: PageRoute,
) -> impl Fn(HttpRequest, web::Data<Arc<AppState>>) -> LocalBoxFuture<'static, HttpResponse> + Clone + 'static {
    move |req: HttpRequest, state: web::Data<Arc<AppState>>| {
        let route = route.clone();
        Box::pin(async move { handle_page_request(req, state, route).await })
    }
}

async fn handle_page_request(req: HttpRequest, state: web::Data<Arc<AppState>>, route: PageRoute) -> HttpResponse {
    if debug::requested(&req) {
        if let Err(e) = debug::check_credentials(
            &req,
            state.settings.debug_login.as_deref(),
            state.settings.debug_password.as_deref(),
        ) {
            // §7 "DebugUnauthorized: short-circuit 401 with WWW-Authenticate".
            let mut response = e.error_response();
            response.headers_mut().insert(
                actix_web::http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"debug\""),
            );
            return response;
        }
    }

    let metrics = apphost_common::Metrics::from(&state.metrics);
    let Some(token) = state.limiter.try_admit(&metrics) else {
        let err: ApiError = ApiErrorKind::ActiveHandlerLimitExceeded.into();
        return err.error_response();
    };

    let Some(method) = from_actix_method(req.method()) else {
        return HttpResponse::MethodNotAllowed().finish();
    };

    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(next_request_id);
    let context = RequestContext::new(
        request_id,
        route.handler_name,
        RequestSummary {
            method: method.as_str().to_owned(),
            path: req.path().to_owned(),
        },
    );
    let pipeline_state = PipelineState::new(context, Some(token));

    let mut page = (route.factory)(state.http_client.clone());
    let outcome = pipeline::execute(&mut *page, method, pipeline_state).await;

    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &outcome.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.body(outcome.body)
}

#[derive(Serialize)]
struct VersionBody {
    name: &'static str,
    version: &'static str,
}

async fn version() -> HttpResponse {
    HttpResponse::Ok().json(VersionBody {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusBody {
    started_at: String,
    datacenter: &'static str,
}

async fn status(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(StatusBody {
        started_at: state.started_at.clone(),
        datacenter: option_env!("DATACENTER").unwrap_or("unknown"),
    })
}

#[derive(Serialize)]
struct HeartbeatBody {
    ok: bool,
}

async fn heartbeat() -> HttpResponse {
    HttpResponse::Ok().json(HeartbeatBody { ok: true })
}

async fn lbheartbeat() -> HttpResponse {
    HttpResponse::Ok().content_type("application/json").body("{}")
}

/// Grounded on `syncserver::server::build_cors` / `syncserver_settings`'s identically named CORS
/// fields.
pub fn build_cors(settings: &apphost_settings::Settings) -> Cors {
    let mut cors = Cors::default();

    if let Some(allowed_methods) = &settings.cors_allowed_methods {
        let methods = allowed_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
            .collect::<Vec<_>>();
        cors = cors.allowed_methods(methods);
    }
    if let Some(allowed_headers) = &settings.cors_allowed_headers {
        cors = cors.allowed_headers(allowed_headers.iter().map(String::as_str).collect::<Vec<_>>());
    }
    if let Some(max_age) = settings.cors_max_age {
        cors = cors.max_age(max_age);
    }
    match &settings.cors_allowed_origin {
        Some(origin) if origin == "*" => cors = cors.allow_any_origin(),
        Some(origin) => cors = cors.allowed_origin(origin),
        None => {}
    }

    cors
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dockerflow_endpoints_are_listed() {
        assert!(DOCKER_FLOW_ENDPOINTS.contains(&"/__heartbeat__"));
        assert!(DOCKER_FLOW_ENDPOINTS.contains(&"/version/"));
    }

    #[test]
    fn default_cors_builds_without_panicking() {
        let settings = apphost_settings::Settings::default();
        let _cors = build_cors(&settings);
    }
}
