use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{ComprehensiveReport, MarketCorrelation, MarketView, StoreTotals, UserView};
use crate::db::RelationshipStore;
use crate::error::AppError;

const DEFAULT_CORRELATION_LIMIT: i64 = 20;
const MAX_CORRELATION_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: RelationshipStore,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/markets/:id", get(get_market))
        .route("/users/:address", get(get_user))
        .route("/correlations", get(get_correlations))
        .route("/report", get(get_report))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CorrelationsQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub totals: StoreTotals,
}

#[derive(Serialize)]
pub struct CorrelationsResponse {
    pub limit: i64,
    pub correlations: Vec<MarketCorrelation>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let totals = state.store.totals().await?;
    Ok(Json(HealthResponse { status: "ok", totals }))
}

async fn get_market(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> Result<Json<MarketView>, AppError> {
    Ok(Json(state.store.market_view(&market_id).await?))
}

async fn get_user(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<UserView>, AppError> {
    Ok(Json(state.store.user_view(&address).await?))
}

async fn get_correlations(
    State(state): State<ApiState>,
    Query(params): Query<CorrelationsQuery>,
) -> Result<Json<CorrelationsResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_CORRELATION_LIMIT)
        .clamp(1, MAX_CORRELATION_LIMIT);
    let correlations = state.store.market_correlations(limit).await?;
    Ok(Json(CorrelationsResponse { limit, correlations }))
}

async fn get_report(State(state): State<ApiState>) -> Result<Json<ComprehensiveReport>, AppError> {
    Ok(Json(state.store.comprehensive_report().await?))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::db::UserActivitySource;
    use crate::test_support::spawn_server;
    use crate::types::Entity;

    async fn seeded_api() -> String {
        let store = RelationshipStore::in_memory().await.unwrap();
        let events: Vec<Entity> = vec![json!({"id": "e1", "markets": [{"id": "m1", "question": "Market one"}]})
            .as_object()
            .cloned()
            .unwrap()];
        store.upsert_market_relationships(&events, &[]).await.unwrap();

        let positions = Value::Null;
        for user in ["0xA", "0xB"] {
            let trades: Vec<Entity> = ["m1", "m2"]
                .iter()
                .map(|m| json!({"maker": user, "market": m, "volume": 2}).as_object().cloned().unwrap())
                .collect();
            let source = UserActivitySource {
                user_address: user,
                orders: &[],
                trades: &trades,
                positions: &positions,
            };
            store.upsert_user_market_activity(source, None, None).await.unwrap();
        }
        spawn_server(router(ApiState { store })).await
    }

    async fn get_json(url: String) -> (u16, Value) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn market_and_user_views() {
        let base = seeded_api().await;

        let (status, market) = get_json(format!("{base}/markets/m1")).await;
        assert_eq!(status, 200);
        assert_eq!(market["market_info"]["market_name"], "Market one");
        assert_eq!(market["trading_statistics"]["total_users"], 2);

        let (_, unknown) = get_json(format!("{base}/markets/nope")).await;
        assert!(unknown["market_info"].is_null());

        let (_, user) = get_json(format!("{base}/users/0xA")).await;
        assert_eq!(user["trading_summary"]["active_markets"], 2);
        assert_eq!(user["trading_summary"]["total_volume"], 4.0);
    }

    #[tokio::test]
    async fn correlations_limit_is_clamped() {
        let base = seeded_api().await;

        let (_, body) = get_json(format!("{base}/correlations")).await;
        assert_eq!(body["limit"], DEFAULT_CORRELATION_LIMIT);
        assert_eq!(body["correlations"].as_array().unwrap().len(), 1);
        assert_eq!(body["correlations"][0]["common_users"], 2);

        let (_, body) = get_json(format!("{base}/correlations?limit=0")).await;
        assert_eq!(body["limit"], 1);
    }

    #[tokio::test]
    async fn report_and_health() {
        let base = seeded_api().await;

        let (_, report) = get_json(format!("{base}/report")).await;
        assert_eq!(report["summary"]["total_users"], 2);
        assert_eq!(report["summary"]["total_markets"], 1);

        let (_, health) = get_json(format!("{base}/health")).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["totals"]["activities"], 4);
    }
}
