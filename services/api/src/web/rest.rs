//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{NaiveDate, NaiveTime};
use driving_school_core::{
    picklist, Lesson, LessonFieldValue, LessonId, LessonItem, LessonPatch, PortError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_catalog_handler,
        list_lesson_items_handler,
        get_lesson_handler,
        update_lesson_handler,
    ),
    components(
        schemas(LessonItemResponse, LessonResponse, UpdateLessonRequest)
    ),
    tags(
        (name = "Driving School API", description = "Lessons and the topics covered in them.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, Debug, PartialEq, ToSchema)]
pub struct LessonItemResponse {
    pub id: i64,
    pub title: String,
}

impl From<&LessonItem> for LessonItemResponse {
    fn from(item: &LessonItem) -> Self {
        Self {
            id: item.id.0,
            title: item.title.clone(),
        }
    }
}

#[derive(Serialize, Debug, PartialEq, ToSchema)]
pub struct LessonResponse {
    pub id: i64,
    pub profile_id: Uuid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration_hours: f64,
}

impl From<Lesson> for LessonResponse {
    fn from(lesson: Lesson) -> Self {
        Self {
            id: lesson.id.0,
            profile_id: lesson.profile_id,
            date: lesson.date,
            time: lesson.time,
            duration_hours: lesson.duration_hours,
        }
    }
}

/// The editable lesson fields. Anything else in the body is refused.
#[derive(Deserialize, Debug, Default, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateLessonRequest {
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub duration_hours: Option<f64>,
}

impl From<UpdateLessonRequest> for LessonPatch {
    fn from(req: UpdateLessonRequest) -> Self {
        let changes = [
            req.date.map(LessonFieldValue::Date),
            req.time.map(LessonFieldValue::Time),
            req.duration_hours.map(LessonFieldValue::DurationHours),
        ];
        LessonPatch {
            changes: changes.into_iter().flatten().collect(),
        }
    }
}

/// Maps a port failure to the status code and message returned to the client.
pub fn port_error_response(context: &str, e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        PortError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        PortError::Unexpected(_) => {
            error!("{}: {:?}", context, e);
            (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
        }
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List the whole lesson item catalog, sorted by id.
#[utoipa::path(
    get,
    path = "/lesson-items",
    responses(
        (status = 200, description = "The catalog", body = [LessonItemResponse]),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_catalog_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let catalog = app_state
        .relations
        .list_catalog()
        .await
        .map_err(|e| port_error_response("Failed to list lesson items", e))?;

    let response: Vec<LessonItemResponse> = picklist::filter(&catalog, None)
        .into_iter()
        .map(LessonItemResponse::from)
        .collect();
    Ok(Json(response))
}

/// List the items covered by a lesson, in the order they were added.
#[utoipa::path(
    get,
    path = "/lessons/{lesson_id}/items",
    responses(
        (status = 200, description = "Items linked to the lesson", body = [LessonItemResponse]),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("lesson_id" = i64, Path, description = "The lesson's id.")
    )
)]
pub async fn list_lesson_items_handler(
    State(app_state): State<Arc<AppState>>,
    Path(lesson_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let items = app_state
        .relations
        .list_associations(LessonId(lesson_id))
        .await
        .map_err(|e| port_error_response("Failed to list lesson items", e))?;

    let response: Vec<LessonItemResponse> = items.iter().map(LessonItemResponse::from).collect();
    Ok(Json(response))
}

/// Fetch a single lesson.
#[utoipa::path(
    get,
    path = "/lessons/{lesson_id}",
    responses(
        (status = 200, description = "The lesson", body = LessonResponse),
        (status = 404, description = "No such lesson"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("lesson_id" = i64, Path, description = "The lesson's id.")
    )
)]
pub async fn get_lesson_handler(
    State(app_state): State<Arc<AppState>>,
    Path(lesson_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let lesson = app_state
        .lessons
        .get_lesson(LessonId(lesson_id))
        .await
        .map_err(|e| port_error_response("Failed to load lesson", e))?;
    Ok(Json(LessonResponse::from(lesson)))
}

/// Change a lesson's date, time or duration.
#[utoipa::path(
    patch,
    path = "/lessons/{lesson_id}",
    request_body = UpdateLessonRequest,
    responses(
        (status = 200, description = "The updated lesson", body = LessonResponse),
        (status = 400, description = "Empty patch or invalid value"),
        (status = 404, description = "No such lesson"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("lesson_id" = i64, Path, description = "The lesson's id.")
    )
)]
pub async fn update_lesson_handler(
    State(app_state): State<Arc<AppState>>,
    Path(lesson_id): Path<i64>,
    Json(req): Json<UpdateLessonRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let patch = LessonPatch::from(req);
    patch
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let lesson = app_state
        .lessons
        .update_lesson(LessonId(lesson_id), &patch)
        .await
        .map_err(|e| port_error_response("Failed to update lesson", e))?;
    Ok((StatusCode::OK, Json(LessonResponse::from(lesson))))
}
