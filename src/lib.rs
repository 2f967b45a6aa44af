pub mod business_hours;
pub mod campaigns;
pub mod channels;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod events;
pub mod flow;
pub mod gateway;
pub mod integrations;
pub mod interactive;
pub mod scheduler;
pub mod session;
pub mod timers;
pub mod types;

pub use config::Config;

use self::business_hours::BusinessHoursConfig;
use self::campaigns::NewCampaign;
use self::channels::whatsapp::{self as whatsapp_channel, WhatsAppSidecar};
use self::config::{load_config, resolve_database_url};
use self::db::DbKind;
use self::error::DispatchError;
use self::events::CampaignEvent;
use self::gateway::{ContentGenerator, Integrations, MessagingGateway};
use self::interactive::{FlowEngine, NewInteractiveCampaign};
use self::scheduler::Scheduler;
use self::types::{IncomingMessage, MessageStatus};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

pub const TOKEN_HEADER: &str = "X-Flowcast-Token";

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub gateway: Arc<dyn MessagingGateway>,
    pub integrations: Integrations,
    pub generator: Option<Arc<dyn ContentGenerator>>,
    pub events: broadcast::Sender<CampaignEvent>,
}

impl AppState {
    pub fn new(config: Config, pool: AnyPool, db_kind: DbKind, gateway: Arc<dyn MessagingGateway>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            pool,
            db_kind,
            gateway,
            integrations: Integrations::default(),
            generator: None,
            events,
        }
    }

    pub fn with_integrations(mut self, integrations: Integrations) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ContentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Upper bound for any single call to the provider or a CRM.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.whatsapp.timeout_seconds.max(1))
    }
}

/// Everything the HTTP layer and the background loops share.
#[derive(Clone)]
pub struct Service {
    pub state: AppState,
    pub engine: FlowEngine,
    pub scheduler: Arc<Scheduler>,
}

impl Service {
    pub fn new(state: AppState) -> Self {
        Self {
            engine: FlowEngine::new(state.clone()),
            scheduler: Arc::new(Scheduler::new(state.clone())),
            state,
        }
    }

    /// Starts the dispatcher, the scheduled publisher and the idle-session
    /// sweep, and re-arms delay timers persisted before a restart.
    pub fn spawn_background(&self) {
        tokio::spawn(self.scheduler.clone().run());
        tokio::spawn(self.engine.clone().run_publisher());
        tokio::spawn(self.engine.clone().run_expiry_sweep());
        let engine = self.engine.clone();
        tokio::spawn(async move {
            match engine.rearm_delays(None).await {
                Ok(0) => {}
                Ok(armed) => info!(armed, "re-armed delay timers"),
                Err(err) => error!("re-arming delay timers failed: {err:?}"),
            }
        });
    }
}

pub async fn create_app() -> anyhow::Result<(Service, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let gateway = Arc::new(WhatsAppSidecar::new(&config.whatsapp)?);
    let mut state = AppState::new(config.clone(), pool, db_kind, gateway)
        .with_integrations(integrations::integrations_from_config(&config.integrations)?);
    if let Some(endpoint) = config.generator.as_ref() {
        state = state.with_generator(Arc::new(integrations::HttpContentGenerator::new(endpoint)?));
    }

    let service = Service::new(state);
    service.spawn_background();
    let app = build_router(service.clone());
    Ok((service, app))
}

pub fn build_router(service: Service) -> Router {
    let inbound_path = service.state.config.whatsapp.inbound_path.clone();

    let authed_routes = Router::new()
        .route("/v1/campaigns", post(create_campaign))
        .route("/v1/campaigns/:id", get(get_campaign).delete(delete_campaign))
        .route("/v1/campaigns/:id/messages", get(list_campaign_messages))
        .route("/v1/campaigns/:id/business-hours", put(put_business_hours))
        .route("/v1/campaigns/:id/start", post(start_campaign))
        .route("/v1/campaigns/:id/pause", post(pause_campaign))
        .route("/v1/campaigns/:id/resume", post(resume_campaign))
        .route("/v1/interactive", post(create_interactive))
        .route("/v1/interactive/:id", get(get_interactive))
        .route("/v1/interactive/:id/sessions", get(list_sessions))
        .route("/v1/interactive/:id/publish", post(publish_interactive))
        .route("/v1/interactive/:id/pause", post(pause_interactive))
        .route("/v1/interactive/:id/resume", post(resume_interactive))
        .route("/v1/interactive/:id/complete", post(complete_interactive))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/inbound", post(inbound))
        .layer(middleware::from_fn_with_state(service.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route(&inbound_path, post(whatsapp_inbound));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(service)
}

async fn require_auth(
    State(service): State<Service>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = service.state.config.auth.token.as_ref() {
        let header = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::NotFound(_) | DispatchError::CampaignMissing(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DispatchError::Configuration(_) | DispatchError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Delivery(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Store(err) => {
                error!("store error: {err:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, DispatchError>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageFilter {
    pub status: Option<String>,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(service): State<Service>) -> ApiResult<db::StoreCounts> {
    let state = &service.state;
    Ok(Json(db::store_counts(&state.pool, state.db_kind).await?))
}

async fn create_campaign(
    State(service): State<Service>,
    Json(req): Json<NewCampaign>,
) -> Result<impl IntoResponse, DispatchError> {
    let campaign = campaigns::create_campaign(&service.state, req).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_campaign(State(service): State<Service>, Path(id): Path<String>) -> ApiResult<types::Campaign> {
    Ok(Json(campaigns::get_campaign(&service.state, &id).await?))
}

async fn delete_campaign(State(service): State<Service>, Path(id): Path<String>) -> Result<StatusCode, DispatchError> {
    campaigns::delete_campaign(&service.state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_campaign_messages(
    State(service): State<Service>,
    Path(id): Path<String>,
    Query(filter): Query<MessageFilter>,
) -> ApiResult<Vec<types::CampaignMessage>> {
    let state = &service.state;
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<MessageStatus>)
        .transpose()
        .map_err(|err| DispatchError::Configuration(err.to_string()))?;
    campaigns::get_campaign(state, &id).await?;
    Ok(Json(
        db::list_campaign_messages(&state.pool, state.db_kind, &id, status).await?,
    ))
}

/// Business hours may be attached to either kind of campaign.
async fn put_business_hours(
    State(service): State<Service>,
    Path(id): Path<String>,
    Json(hours): Json<BusinessHoursConfig>,
) -> ApiResult<BusinessHoursConfig> {
    let state = &service.state;
    hours
        .validate()
        .map_err(|err| DispatchError::Configuration(err.to_string()))?;
    let bulk = db::get_campaign(&state.pool, state.db_kind, &id).await?;
    let flow = db::get_interactive_campaign(&state.pool, state.db_kind, &id).await?;
    if bulk.is_none() && flow.is_none() {
        return Err(DispatchError::NotFound(format!("campaign {id}")));
    }
    db::upsert_business_hours(&state.pool, state.db_kind, &id, &hours).await?;
    Ok(Json(hours))
}

async fn start_campaign(State(service): State<Service>, Path(id): Path<String>) -> ApiResult<types::Campaign> {
    Ok(Json(campaigns::start_campaign(&service.state, &id).await?))
}

async fn pause_campaign(State(service): State<Service>, Path(id): Path<String>) -> ApiResult<types::Campaign> {
    Ok(Json(campaigns::pause_campaign(&service.state, &id).await?))
}

async fn resume_campaign(State(service): State<Service>, Path(id): Path<String>) -> ApiResult<types::Campaign> {
    Ok(Json(campaigns::resume_campaign(&service.state, &id).await?))
}

async fn create_interactive(
    State(service): State<Service>,
    Json(req): Json<NewInteractiveCampaign>,
) -> Result<impl IntoResponse, DispatchError> {
    let campaign = service.engine.create(req).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_interactive(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<types::InteractiveCampaign> {
    let state = &service.state;
    db::get_interactive_campaign(&state.pool, state.db_kind, &id)
        .await?
        .map(Json)
        .ok_or_else(|| DispatchError::NotFound(format!("interactive campaign {id}")))
}

async fn list_sessions(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<Vec<session::ContactSession>> {
    let state = &service.state;
    Ok(Json(
        db::list_sessions_for_campaign(&state.pool, state.db_kind, &id).await?,
    ))
}

async fn get_session(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<session::ContactSession> {
    let state = &service.state;
    db::get_contact_session(&state.pool, state.db_kind, &id)
        .await?
        .map(Json)
        .ok_or_else(|| DispatchError::NotFound(format!("session {id}")))
}

async fn publish_interactive(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<interactive::DispatchReport> {
    Ok(Json(service.engine.publish(&id).await?))
}

async fn pause_interactive(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<types::InteractiveCampaign> {
    Ok(Json(service.engine.pause(&id).await?))
}

async fn resume_interactive(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<types::InteractiveCampaign> {
    Ok(Json(service.engine.resume(&id).await?))
}

async fn complete_interactive(
    State(service): State<Service>,
    Path(id): Path<String>,
) -> ApiResult<types::InteractiveCampaign> {
    Ok(Json(service.engine.complete(&id).await?))
}

async fn inbound(
    State(service): State<Service>,
    Json(message): Json<IncomingMessage>,
) -> impl IntoResponse {
    Json(service.engine.process_incoming_message(message).await)
}

async fn whatsapp_inbound(
    State(service): State<Service>,
    Json(payload): Json<whatsapp_channel::WhatsAppInboundPayload>,
) -> impl IntoResponse {
    let message = whatsapp_channel::normalize_whatsapp_inbound(payload);
    let outcome = service.engine.process_incoming_message(message).await;
    Json(outcome)
}
