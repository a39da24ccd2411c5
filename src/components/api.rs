use crate::{
    components::prober::Prober,
    error::AppResult,
    store::Store,
    types::{StateRow, Validity},
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static PARAM_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\-]+:\d{2,}$").unwrap());
static PARAM_SNI: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\-]+$").unwrap());
static PARAM_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/// Everything the handlers need, passed by state instead of a process-wide
/// handle.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Store,
    pub prober: Prober,
}

pub fn router(context: ApiContext) -> Router {
    Router::new()
        .route("/check", get(on_check).post(on_check))
        .route(
            "/states",
            get(on_states).post(on_state_add).delete(on_state_delete),
        )
        .route("/certs", get(on_certs))
        .route("/report/valid", get(on_report_valid).post(on_report_valid))
        .route("/report/expire", get(on_report_expire).post(on_report_expire))
        .route(
            "/zabbix/discovery/certs",
            get(on_zabbix_certs).post(on_zabbix_certs),
        )
        .route(
            "/zabbix/discovery/states",
            get(on_zabbix_states).post(on_zabbix_states),
        )
        .with_state(context)
}

pub async fn serve(
    listener: TcpListener,
    context: ApiContext,
    cancel: CancellationToken,
) -> AppResult<()> {
    axum::serve(listener, router(context))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(crate::error::ErrorReason::Io)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct EndpointParams {
    host: Option<String>,
    sni: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdParam {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilterParam {
    filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZabbixCertParams {
    expire: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZabbixStateParams {
    valid: Option<String>,
}

#[derive(Serialize)]
struct ZabbixCertDiscovery {
    #[serde(rename = "{#NAME}")]
    name: String,
    #[serde(rename = "{#ID}")]
    id: i64,
}

#[derive(Serialize)]
struct ZabbixStateDiscovery {
    #[serde(rename = "{#ID}")]
    id: i64,
    #[serde(rename = "{#HOST}")]
    host: String,
    #[serde(rename = "{#SNI}")]
    sni: String,
}

fn bad_request(route: &str, params: &dyn std::fmt::Debug) -> Response {
    warn!("Invalid request parameters for {}: {:?}", route, params);
    StatusCode::BAD_REQUEST.into_response()
}

fn parse_number(value: &Option<String>) -> Option<i64> {
    value
        .as_deref()
        .filter(|v| PARAM_NUMBER.is_match(v))
        .and_then(|v| v.parse().ok())
}

/// Probes the endpoint right now and returns the outcome without
/// persisting it.
async fn on_check(
    State(context): State<ApiContext>,
    Query(params): Query<EndpointParams>,
) -> Response {
    let Some(host) = params.host.as_deref().filter(|h| PARAM_HOST.is_match(h)) else {
        return bad_request("/check", &params);
    };
    let sni = params
        .sni
        .as_deref()
        .filter(|s| PARAM_SNI.is_match(s))
        .unwrap_or("");

    let mut state = StateRow::new(host, sni);
    context.prober.update_state(&mut state).await;
    Json(state).into_response()
}

async fn on_states(
    State(context): State<ApiContext>,
    Query(params): Query<IdParam>,
) -> Response {
    match &params.id {
        None => Json(context.store.get_states().await).into_response(),
        Some(_) => match parse_number(&params.id) {
            Some(id) => Json(context.store.get_state_by_id(id).await).into_response(),
            None => bad_request("/states", &params),
        },
    }
}

async fn on_state_add(
    State(context): State<ApiContext>,
    Query(params): Query<EndpointParams>,
) -> Response {
    let Some(host) = params.host.as_deref().filter(|h| PARAM_HOST.is_match(h)) else {
        return bad_request("/states", &params);
    };
    let sni = params
        .sni
        .as_deref()
        .filter(|s| PARAM_SNI.is_match(s))
        .unwrap_or("");

    let state = StateRow::new(host, sni);
    match context.store.insert_state(&state).await {
        Ok(()) => Json(state).into_response(),
        Err(e) => {
            error!("Failed to insert state {}: {}", state.host, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn on_state_delete(
    State(context): State<ApiContext>,
    Query(params): Query<IdParam>,
) -> Response {
    let Some(id) = parse_number(&params.id) else {
        return bad_request("/states", &params);
    };
    match context.store.delete_state_by_id(id).await {
        Ok(()) => Json(serde_json::json!({ "id": id })).into_response(),
        Err(e) => {
            error!("Failed to delete state {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn on_certs(State(context): State<ApiContext>, Query(params): Query<IdParam>) -> Response {
    match &params.id {
        None => Json(context.store.get_certificates().await).into_response(),
        Some(_) => match parse_number(&params.id) {
            Some(id) => Json(context.store.get_certificate_by_id(id).await).into_response(),
            None => bad_request("/certs", &params),
        },
    }
}

async fn on_report_valid(
    State(context): State<ApiContext>,
    Query(params): Query<FilterParam>,
) -> Response {
    let Some(validity) = parse_number(&params.filter).and_then(Validity::from_code) else {
        return bad_request("/report/valid", &params);
    };
    Json(context.store.get_states_by_valid(validity).await).into_response()
}

async fn on_report_expire(
    State(context): State<ApiContext>,
    Query(params): Query<FilterParam>,
) -> Response {
    let Some(days) = parse_number(&params.filter) else {
        return bad_request("/report/expire", &params);
    };
    Json(context.store.get_certificates_by_expire(days).await).into_response()
}

async fn on_zabbix_certs(
    State(context): State<ApiContext>,
    Query(params): Query<ZabbixCertParams>,
) -> Response {
    let Some(days) = parse_number(&params.expire) else {
        return bad_request("/zabbix/discovery/certs", &params);
    };
    let discovery: Vec<ZabbixCertDiscovery> = context
        .store
        .get_certificates_by_expire(days)
        .await
        .into_iter()
        .map(|cert| ZabbixCertDiscovery {
            name: cert.common_name,
            id: cert.id,
        })
        .collect();
    Json(discovery).into_response()
}

async fn on_zabbix_states(
    State(context): State<ApiContext>,
    Query(params): Query<ZabbixStateParams>,
) -> Response {
    let Some(validity) = parse_number(&params.valid).and_then(Validity::from_code) else {
        return bad_request("/zabbix/discovery/states", &params);
    };
    let discovery: Vec<ZabbixStateDiscovery> = context
        .store
        .get_states_by_valid(validity)
        .await
        .into_iter()
        .map(|state| ZabbixStateDiscovery {
            id: state.id,
            host: state.host,
            sni: state.sni,
        })
        .collect();
    Json(discovery).into_response()
}
