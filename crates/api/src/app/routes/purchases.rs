use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use procura_core::PurchaseId;
use procura_infra::PurchaseService;
use procura_purchasing::{NewPurchase, PurchaseFilter, PurchasePatch};

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_purchases).post(create_purchase))
        .route("/export", get(export_purchases))
        .route("/batch", post(import_purchases))
        .route("/:id", get(get_purchase).patch(update_purchase))
        .route("/:id/status", post(change_purchase_status))
        .route("/:id/deleted", post(set_purchase_deleted))
}

fn parse_id(raw: &str) -> Result<PurchaseId, axum::response::Response> {
    raw.parse().map_err(errors::domain_error_to_response)
}

pub async fn list_purchases(
    Extension(service): Extension<PurchaseService>,
    Query(filter): Query<PurchaseFilter>,
) -> axum::response::Response {
    match service.list(&filter).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn export_purchases(
    Extension(service): Extension<PurchaseService>,
    Query(filter): Query<PurchaseFilter>,
) -> axum::response::Response {
    let file = match service.export_csv(&filter, Utc::now().date_naive()).await {
        Ok(file) => file,
        Err(e) => return errors::store_error_to_response(e),
    };
    let disposition = format!("attachment; filename=\"{}\"", file.file_name);
    (
        [
            (header::CONTENT_TYPE, file.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.content,
    )
        .into_response()
}

pub async fn get_purchase(
    Extension(service): Extension<PurchaseService>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.get(id).await {
        Ok(purchase) => Json(purchase).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn create_purchase(
    Extension(service): Extension<PurchaseService>,
    Json(body): Json<NewPurchase>,
) -> axum::response::Response {
    match service.create(body).await {
        Ok(purchase) => (StatusCode::CREATED, Json(purchase)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn update_purchase(
    Extension(service): Extension<PurchaseService>,
    Path(id): Path<String>,
    Json(body): Json<PurchasePatch>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.update(id, body).await {
        Ok(purchase) => Json(purchase).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn change_purchase_status(
    Extension(service): Extension<PurchaseService>,
    Path(id): Path<String>,
    Json(body): Json<dto::ChangeStatusRequest>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.change_status(id, body.into()).await {
        Ok(purchase) => Json(purchase).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn set_purchase_deleted(
    Extension(service): Extension<PurchaseService>,
    Path(id): Path<String>,
    Json(body): Json<dto::SetDeletedRequest>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.set_deleted(id, body.deleted).await {
        Ok(purchase) => Json(purchase).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn import_purchases(
    Extension(service): Extension<PurchaseService>,
    Json(body): Json<dto::BatchImportBody>,
) -> axum::response::Response {
    let (request, created_by) = body.into_parts();
    match service.import_batch(request, created_by).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
