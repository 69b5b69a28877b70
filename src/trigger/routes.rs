//! HTTP trigger surface: manual and webhook runs, lead intake, status,
//! reconcile, and the public opt-out page.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::auth::{self, AuthCheck};
use crate::campaign::engine::UnsubscribeOutcome;
use crate::campaign::leads::{NewLead, SubmitOutcome};
use crate::campaign::model::{BatchResult, EmailStep};
use crate::campaign::service::Campaign;
use crate::error::{CampaignError, ConfigError, Error};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub campaign: Arc<Campaign>,
}

/// Build the Axum router for the campaign service.
pub fn campaign_routes(campaign: Arc<Campaign>) -> Router {
    let state = AppState { campaign };

    Router::new()
        .route("/health", get(health))
        .route("/api/campaign/run", post(manual_run))
        .route("/api/campaign/webhook", post(webhook_run))
        .route("/api/campaign/status", get(status))
        .route("/api/campaign/reconcile", post(reconcile))
        .route("/api/leads", post(submit_leads))
        .route("/unsubscribe", get(confirm_unsubscribe).post(unsubscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Errors surfaced to HTTP callers as `{"error": ...}` with a status code.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// Server-side misconfiguration.
    Config(String),
    /// The lead store failed; the batch was aborted.
    Unavailable(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Config(e) => ApiError::Config(e.to_string()),
            Error::Store(e) => ApiError::Unavailable(e.to_string()),
            Error::Send(e) => ApiError::Config(e.to_string()),
            Error::Campaign(e) => match e {
                CampaignError::InvalidStep(_) | CampaignError::InvalidEmail(_) => {
                    ApiError::BadRequest(e.to_string())
                }
                CampaignError::LeadNotFound(_) => ApiError::NotFound(e.to_string()),
                CampaignError::TransitionRejected { .. } => ApiError::Conflict(e.to_string()),
            },
        }
    }
}

impl From<crate::error::StoreError> for ApiError {
    fn from(e: crate::error::StoreError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Config(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match auth::check(state.campaign.config().shared_secret.as_ref(), headers) {
        AuthCheck::Authorized => Ok(()),
        AuthCheck::Rejected => {
            warn!("Rejected request with a bad or missing secret");
            Err(ApiError::Unauthorized)
        }
        AuthCheck::NotConfigured => {
            error!("CAMPAIGN_SHARED_SECRET is not set, refusing guarded request");
            Err(Error::from(ConfigError::MissingRequired {
                key: "CAMPAIGN_SHARED_SECRET".into(),
                hint: "Set it to enable the run, lead and admin endpoints.".into(),
            })
            .into())
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "drip-campaign"
    }))
}

// ── Runs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub step: u8,
    #[serde(default, alias = "batchSize")]
    pub batch_size: Option<usize>,
    #[serde(default, alias = "timeBudgetMs")]
    pub time_budget_ms: Option<u64>,
}

/// Which budget a trigger uses when the request names none.
#[derive(Debug, Clone, Copy)]
enum DefaultBudget {
    Page,
    Drain,
}

async fn manual_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunRequest>,
) -> Result<Json<BatchResult>, ApiError> {
    run(&state, &headers, body, DefaultBudget::Page, "manual").await
}

async fn webhook_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunRequest>,
) -> Result<Json<BatchResult>, ApiError> {
    run(&state, &headers, body, DefaultBudget::Drain, "webhook").await
}

async fn run(
    state: &AppState,
    headers: &HeaderMap,
    body: RunRequest,
    default: DefaultBudget,
    trigger: &str,
) -> Result<Json<BatchResult>, ApiError> {
    authorize(state, headers)?;
    let step = EmailStep::from_number(body.step).map_err(Error::from)?;
    let campaign = &state.campaign;

    let budget = match (body.batch_size, body.time_budget_ms, default) {
        (Some(n), _, _) => campaign.page_budget(Some(n)),
        (None, Some(ms), _) => campaign.drain_budget(Some(ms)),
        (None, None, DefaultBudget::Page) => campaign.page_budget(None),
        (None, None, DefaultBudget::Drain) => campaign.drain_budget(None),
    };
    info!(trigger, step = step.number(), budget = ?budget, "Batch triggered");

    let result = campaign.run_batch(step, budget).await?;
    Ok(Json(result))
}

// ── Leads ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LeadsRequest {
    Many { leads: Vec<NewLead> },
    One(NewLead),
}

#[derive(Debug, Default, Serialize)]
pub struct SubmitSummary {
    pub created: usize,
    pub updated: usize,
    pub errors: Vec<SubmitFailure>,
}

#[derive(Debug, Serialize)]
pub struct SubmitFailure {
    pub email: String,
    pub error: String,
}

async fn submit_leads(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LeadsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let leads = match body {
        LeadsRequest::Many { leads } => leads,
        LeadsRequest::One(lead) => vec![lead],
    };

    let mut summary = SubmitSummary::default();
    for lead in leads {
        let email = lead.email.clone();
        match state.campaign.submit(lead).await {
            Ok(SubmitOutcome::Created) => summary.created += 1,
            Ok(SubmitOutcome::Updated) => summary.updated += 1,
            Err(Error::Store(e)) => return Err(e.into()),
            Err(e) => summary.errors.push(SubmitFailure {
                email,
                error: e.to_string(),
            }),
        }
    }
    info!(
        created = summary.created,
        updated = summary.updated,
        rejected = summary.errors.len(),
        "Leads submitted"
    );

    let status = if summary.created + summary.updated == 0 && !summary.errors.is_empty() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(summary)))
}

// ── Admin ───────────────────────────────────────────────────────────────

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let counts = state.campaign.stage_counts().await?;

    let total: usize = counts.iter().map(|(_, n)| n).sum();
    let stages: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(stage, n)| (stage.as_str().to_string(), n.into()))
        .collect();
    Ok(Json(serde_json::json!({ "stages": stages, "total": total })))
}

async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let report = state.campaign.reconcile().await?;
    Ok(Json(report))
}

// ── Opt-out ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    #[serde(default)]
    pub email: Option<String>,
}

fn requested_email(query: UnsubscribeQuery) -> Option<String> {
    query
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
}

fn incomplete_link() -> (StatusCode, Html<String>) {
    (
        StatusCode::BAD_REQUEST,
        opt_out_page("Missing email address", "<p>The unsubscribe link is incomplete.</p>"),
    )
}

/// The link in the email lands here. Nothing changes until the form is
/// submitted, so link scanners that prefetch it cannot opt anyone out.
async fn confirm_unsubscribe(Query(query): Query<UnsubscribeQuery>) -> impl IntoResponse {
    let Some(email) = requested_email(query) else {
        return incomplete_link();
    };
    let body = format!(
        "<p>Stop all further campaign emails to {}?</p>\
         <form method=\"post\" action=\"/unsubscribe?email={}\">\
         <button type=\"submit\">Unsubscribe</button></form>",
        escape_html(&email),
        urlencoding::encode(&email)
    );
    (StatusCode::OK, opt_out_page("Unsubscribe", &body))
}

/// Performs the opt-out. Also the target of one-click unsubscribe POSTs.
async fn unsubscribe(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeQuery>,
) -> impl IntoResponse {
    let Some(email) = requested_email(query) else {
        return incomplete_link();
    };

    match state.campaign.unsubscribe(&email).await {
        Ok(outcome) => {
            info!(email = %email, outcome = ?outcome, "Opt-out request");
            let (title, detail) = match outcome {
                UnsubscribeOutcome::Unsubscribed => (
                    "You have been unsubscribed",
                    format!("<p>{} will not receive any more emails from this campaign.</p>", escape_html(&email)),
                ),
                UnsubscribeOutcome::AlreadyUnsubscribed => (
                    "Already unsubscribed",
                    format!("<p>{} was already opted out. Nothing else to do.</p>", escape_html(&email)),
                ),
                UnsubscribeOutcome::NotFound => (
                    "Address not found",
                    format!("<p>We have no campaign emails on file for {}.</p>", escape_html(&email)),
                ),
            };
            (StatusCode::OK, opt_out_page(title, &detail))
        }
        Err(e) => {
            error!(email = %email, error = %e, "Opt-out failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                opt_out_page("Something went wrong", "<p>Please try the link again in a few minutes.</p>"),
            )
        }
    }
}

/// `body` is trusted markup; escape anything user-supplied before it gets here.
fn opt_out_page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family:sans-serif;max-width:32rem;margin:4rem auto\">\
         <h1>{title}</h1>{body}</body></html>\n"
    ))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
