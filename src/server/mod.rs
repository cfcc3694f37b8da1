//! Full replacement API.
//!
//! Serves the Parse endpoints the bottle app uses from a local SQLite
//! database, with the same JSON shapes as the vendor service.

pub mod accounts;
pub mod auth;
pub mod db;
pub mod error;
pub mod handlers;
pub mod query;
pub mod request;
pub mod schema;
pub mod store;
pub mod totals;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::middleware;
use axum::routing::any;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, SipGuardError};
use crate::logging::DbPool;
use handlers::{classes, functions, users};

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: DbPool, config: ServerConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }

    pub fn conn(&self) -> ApiResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.db.get()?)
    }

    /// Run `work` with a pooled connection on the blocking thread pool.
    ///
    /// Database calls and password hashing never run on the async workers.
    pub async fn run<T, F>(&self, work: F) -> ApiResult<T>
    where
        F: FnOnce(&mut Connection, &AppState) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = state.conn()?;
            work(&mut *conn, &state)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {}", e)))?
    }
}

/// Analytics events the app fires; acknowledged and dropped.
const IGNORED_FUNCTIONS: &[&str] = &[
    "listfirmware",
    "getuserads",
    "getusergroups",
    "getmyfriends",
    "getmyawards",
    "getmychallenges",
    "getclosedchallenges",
    "getjoinablechallenges",
    "trophyanalytics",
];

/// Register `handler` at `path` and at `path/`.
fn with_slash<H, T>(router: Router<AppState>, path: &str, handler: H) -> Router<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    router
        .route(path, any(handler.clone()))
        .route(&format!("{}/", path), any(handler))
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", any(handlers::home))
        .route("/parse/config", any(handlers::config))
        .route("/parse/login", any(users::login))
        .route("/parse/logout", any(users::logout))
        .route("/parse/events/{*event}", any(handlers::empty));

    app = with_slash(app, "/parse/users", users::users);
    app = with_slash(app, "/parse/classes/_User", users::users);
    app = with_slash(app, "/parse/classes/_Installation", classes::installations);
    app = with_slash(app, "/parse/classes/Sip", classes::sips);
    app = with_slash(app, "/parse/classes/Bottle", classes::bottles);
    app = with_slash(app, "/parse/classes/Location", classes::locations);
    app = with_slash(app, "/parse/classes/Day", classes::days);
    app = with_slash(app, "/parse/classes/UserHealthStats", classes::health_stats_list);

    app = app
        .route("/parse/users/{id}", any(users::user))
        .route("/parse/classes/_User/{id}", any(users::user))
        .route("/parse/classes/_Installation/{id}", any(classes::installation))
        .route("/parse/classes/Sip/{id}", any(classes::sip))
        .route("/parse/classes/Bottle/{id}", any(classes::bottle))
        .route("/parse/classes/Location/{id}", any(classes::location))
        .route("/parse/classes/Day/{id}", any(classes::day))
        .route("/parse/classes/UserHealthStats/{id}", any(classes::health_stats));

    app = with_slash(app, "/parse/functions/userexists", functions::user_exists);
    app = with_slash(app, "/parse/functions/canaddbottle", functions::can_add_bottle);
    app = with_slash(app, "/parse/functions/getmyglows", functions::my_glows);
    app = with_slash(app, "/parse/functions/saveglow", functions::save_glow);
    app = with_slash(app, "/parse/functions/deleteglow", functions::delete_glow);
    app = with_slash(app, "/parse/functions/calculatedaytotal", functions::day_total);
    for name in IGNORED_FUNCTIONS {
        app = with_slash(app, &format!("/parse/functions/{}", name), handlers::empty);
    }

    let max_body_bytes = state.config.max_body_bytes;
    app.fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_allowed_host))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

pub struct FullServer {
    config: ServerConfig,
    pool: DbPool,
}

impl FullServer {
    pub fn new(config: ServerConfig, pool: DbPool) -> Self {
        Self { config, pool }
    }

    /// Check the schema, bind the listener and serve in the background.
    /// Returns the bound address.
    pub async fn start(self) -> Result<SocketAddr> {
        {
            let conn = self.pool.get()?;
            db::check_schema(&conn)?;
            let purged = auth::purge_expired_sessions(&conn)
                .map_err(|e| SipGuardError::Server(format!("session cleanup: {}", e)))?;
            if purged > 0 {
                info!("Removed {} expired sessions", purged);
            }
        }

        let listener = TcpListener::bind(&self.config.listen).await?;
        let local_addr = listener.local_addr()?;
        let app = router(AppState::new(self.pool, self.config));
        info!("sipguard server listening on {}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Full server stopped: {}", e);
            }
        });

        Ok(local_addr)
    }
}
