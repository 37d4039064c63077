//! REST API implementation for Google Cloud Pub/Sub.
//!
//! ## API Endpoints
//!
//! ### Topics
//! - `PUT /v1/projects/{project}/topics/{topic}` - Create a topic
//! - `GET /v1/projects/{project}/topics/{topic}` - Get topic details
//! - `DELETE /v1/projects/{project}/topics/{topic}` - Delete a topic
//! - `GET /v1/projects/{project}/topics` - List topics
//! - `GET /v1/projects/{project}/topics/{topic}/subscriptions` - List a topic's subscriptions
//! - `POST /v1/projects/{project}/topics/{topic}:publish` - Publish messages
//!
//! ### Subscriptions
//! - `PUT /v1/projects/{project}/subscriptions/{subscription}` - Create a subscription
//! - `GET /v1/projects/{project}/subscriptions/{subscription}` - Get subscription details
//! - `DELETE /v1/projects/{project}/subscriptions/{subscription}` - Delete a subscription
//! - `GET /v1/projects/{project}/subscriptions` - List subscriptions
//! - `POST /v1/projects/{project}/subscriptions/{subscription}:pull` - Pull messages
//! - `POST /v1/projects/{project}/subscriptions/{subscription}:acknowledge` - Acknowledge messages
//! - `POST /v1/projects/{project}/subscriptions/{subscription}:modifyAckDeadline` - Modify ack deadline
//! - `POST /v1/projects/{project}/subscriptions/{subscription}:modifyPushConfig` - Switch pull/push
//!
//! ### Other
//! - `GET /` - Readiness, answers `Ok` like the Cloud SDK emulator
//! - `GET /metrics` - Prometheus text format (when enabled)

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::metrics::{get_metrics, record_api_request};
use crate::pubsub::publisher::PublisherService;
use crate::pubsub::types::*;
use crate::server::shutdown_receiver;
use crate::storage::StorageBackend;
use crate::types::validation::{validate_ack_deadline, validate_subscription_id, validate_topic_id, ResourceName};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct RestState {
    publisher: PublisherService,
    default_ack_deadline: u32,
}

impl RestState {
    /// Create a new REST state.
    pub fn new(publisher: PublisherService, default_ack_deadline: u32) -> Self {
        Self {
            publisher,
            default_ack_deadline,
        }
    }

    fn backend(&self) -> &Arc<dyn StorageBackend> {
        self.publisher.backend()
    }
}

/// Error answered in the Google API error format.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Create an error response with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// gRPC-style status name for an HTTP status.
fn status_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "INVALID_ARGUMENT",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "ALREADY_EXISTS",
        StatusCode::TOO_MANY_REQUESTS => "RESOURCE_EXHAUSTED",
        StatusCode::PRECONDITION_FAILED => "FAILED_PRECONDITION",
        StatusCode::SERVICE_UNAVAILABLE => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) | Error::InvalidAckId(_) | Error::Config(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::TopicNotFound(_) | Error::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::StorageError(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("REST request failed: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.status.as_u16(),
                message: self.message,
                status: status_name(self.status).to_string(),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Count the request under `operation` and pass the result through.
fn record<T>(operation: &'static str, result: ApiResult<T>) -> ApiResult<T> {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status,
    };
    record_api_request(operation, status.as_u16());
    result
}

/// Parse a JSON body; an empty body means `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> std::result::Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))
}

/// Parse a JSON body that must be present.
fn parse_required<T: DeserializeOwned>(body: &Bytes) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))
}

/// Offset-based paging over an already sorted list.
fn paginate<T>(items: Vec<T>, query: &ListQuery) -> std::result::Result<(Vec<T>, Option<String>), ApiError> {
    let offset = match query.page_token.as_deref() {
        None | Some("") => 0,
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request(format!("Invalid page token: {}", token)))?,
    };
    let page_size = query.page_size.filter(|&n| n > 0).unwrap_or(usize::MAX);

    let total = items.len();
    let page: Vec<T> = items.into_iter().skip(offset).take(page_size).collect();
    let next = offset.saturating_add(page.len());
    let token = (next < total).then(|| next.to_string());
    Ok((page, token))
}

/// Build the REST router over `state`.
pub fn create_router(state: RestState, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/", get(readiness))
        .route(
            "/v1/projects/{project}/topics/{topic}",
            get(get_topic)
                .put(create_topic)
                .delete(delete_topic)
                .post(handle_topic_action),
        )
        .route("/v1/projects/{project}/topics", get(list_topics))
        .route(
            "/v1/projects/{project}/topics/{topic}/subscriptions",
            get(list_topic_subscriptions),
        )
        .route(
            "/v1/projects/{project}/subscriptions/{subscription}",
            get(get_subscription)
                .put(create_subscription)
                .delete(delete_subscription)
                .post(handle_subscription_action),
        )
        .route("/v1/projects/{project}/subscriptions", get(list_subscriptions));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: broadcast::Receiver<()>,
) -> crate::Result<()> {
    let addr = listener.local_addr()?;
    info!("Pub/Sub REST server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_receiver(shutdown))
        .await?;

    info!("Pub/Sub REST server on {} shut down", addr);
    Ok(())
}

async fn readiness() -> &'static str {
    "Ok"
}

async fn metrics_handler() -> Response {
    match get_metrics().gather() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics").into_response()
        }
    }
}

// ============================================================================
// Topic Handlers
// ============================================================================

/// Dispatch `POST .../topics/{topic}:{action}`.
async fn handle_topic_action(
    Path((project, topic_action)): Path<(String, String)>,
    State(state): State<RestState>,
    body: Bytes,
) -> Response {
    let Some((topic, action)) = topic_action.rsplit_once(':') else {
        return ApiError::bad_request("Invalid topic action format (expected topic:action)")
            .into_response();
    };

    match action {
        "publish" => record("Publish", publish(&state, &project, topic, &body).await).into_response(),
        _ => ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Unknown topic action: {}", action),
        )
        .into_response(),
    }
}

async fn create_topic(
    Path((project, topic)): Path<(String, String)>,
    State(state): State<RestState>,
    body: Bytes,
) -> ApiResult<Topic> {
    let result = async {
        validate_topic_id(&topic)?;
        let payload: Topic = parse_body(&body)?;
        let name = ResourceName::topic(&project, &topic);
        info!("REST: CreateTopic {}", name);

        let created = state.backend().create_topic(payload.into_config(name)).await?;
        Ok::<_, ApiError>(Json(Topic::from(&created)))
    }
    .await;
    record("CreateTopic", result)
}

async fn get_topic(
    Path((project, topic)): Path<(String, String)>,
    State(state): State<RestState>,
) -> ApiResult<Topic> {
    let name = ResourceName::topic(&project, &topic);
    debug!("REST: GetTopic {}", name);
    let result = state
        .backend()
        .get_topic(&name)
        .await
        .map(|config| Json(Topic::from(&config)))
        .map_err(ApiError::from);
    record("GetTopic", result)
}

async fn delete_topic(
    Path((project, topic)): Path<(String, String)>,
    State(state): State<RestState>,
) -> ApiResult<Value> {
    let name = ResourceName::topic(&project, &topic);
    info!("REST: DeleteTopic {}", name);
    let result = state
        .backend()
        .delete_topic(&name)
        .await
        .map(|()| Json(json!({})))
        .map_err(ApiError::from);
    record("DeleteTopic", result)
}

async fn list_topics(
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<RestState>,
) -> ApiResult<ListTopicsResponse> {
    debug!("REST: ListTopics {}", project);
    let result = async {
        let topics = state.backend().list_topics(&project).await?;
        let (page, next_page_token) = paginate(topics, &query)?;
        Ok::<_, ApiError>(Json(ListTopicsResponse {
            topics: page.iter().map(Topic::from).collect(),
            next_page_token,
        }))
    }
    .await;
    record("ListTopics", result)
}

async fn list_topic_subscriptions(
    Path((project, topic)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
    State(state): State<RestState>,
) -> ApiResult<ListTopicSubscriptionsResponse> {
    let name = ResourceName::topic(&project, &topic);
    debug!("REST: ListTopicSubscriptions {}", name);
    let result = async {
        let subscriptions = state.backend().list_topic_subscriptions(&name).await?;
        let (subscriptions, next_page_token) = paginate(subscriptions, &query)?;
        Ok::<_, ApiError>(Json(ListTopicSubscriptionsResponse {
            subscriptions,
            next_page_token,
        }))
    }
    .await;
    record("ListTopicSubscriptions", result)
}

async fn publish(
    state: &RestState,
    project: &str,
    topic: &str,
    body: &Bytes,
) -> ApiResult<PublishResponse> {
    let request: PublishRequest = parse_required(body)?;
    let name = ResourceName::topic(project, topic);
    debug!("REST: Publish {} messages to {}", request.messages.len(), name);

    let ids = state.publisher.publish(&name, request.messages).await?;
    Ok(Json(PublishResponse {
        message_ids: ids.into_iter().map(|id| id.0).collect(),
    }))
}

// ============================================================================
// Subscription Handlers
// ============================================================================

/// Dispatch `POST .../subscriptions/{subscription}:{action}`.
async fn handle_subscription_action(
    Path((project, subscription_action)): Path<(String, String)>,
    State(state): State<RestState>,
    body: Bytes,
) -> Response {
    let Some((subscription, action)) = subscription_action.rsplit_once(':') else {
        return ApiError::bad_request(
            "Invalid subscription action format (expected subscription:action)",
        )
        .into_response();
    };
    let name = ResourceName::subscription(&project, subscription);

    match action {
        "pull" => record("Pull", pull(&state, &name, &body).await).into_response(),
        "acknowledge" => record("Acknowledge", acknowledge(&state, &name, &body).await).into_response(),
        "modifyAckDeadline" => record(
            "ModifyAckDeadline",
            modify_ack_deadline(&state, &name, &body).await,
        )
        .into_response(),
        "modifyPushConfig" => record(
            "ModifyPushConfig",
            modify_push_config(&state, &name, &body).await,
        )
        .into_response(),
        _ => ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Unknown subscription action: {}", action),
        )
        .into_response(),
    }
}

async fn create_subscription(
    Path((project, subscription)): Path<(String, String)>,
    State(state): State<RestState>,
    body: Bytes,
) -> ApiResult<Subscription> {
    let result = async {
        validate_subscription_id(&subscription)?;
        let mut payload: Subscription = parse_required(&body)?;
        let name = ResourceName::subscription(&project, &subscription);
        info!("REST: CreateSubscription {} -> {}", name, payload.topic);

        // A bare topic id is taken to live in the subscription's project.
        payload.topic = ResourceName::qualify_topic(&project, &payload.topic);
        let config = payload.into_config(name, state.default_ack_deadline)?;
        let created = state.backend().create_subscription(config).await?;
        Ok::<_, ApiError>(Json(Subscription::from(&created)))
    }
    .await;
    record("CreateSubscription", result)
}

async fn get_subscription(
    Path((project, subscription)): Path<(String, String)>,
    State(state): State<RestState>,
) -> ApiResult<Subscription> {
    let name = ResourceName::subscription(&project, &subscription);
    debug!("REST: GetSubscription {}", name);
    let result = state
        .backend()
        .get_subscription(&name)
        .await
        .map(|config| Json(Subscription::from(&config)))
        .map_err(ApiError::from);
    record("GetSubscription", result)
}

async fn delete_subscription(
    Path((project, subscription)): Path<(String, String)>,
    State(state): State<RestState>,
) -> ApiResult<Value> {
    let name = ResourceName::subscription(&project, &subscription);
    info!("REST: DeleteSubscription {}", name);
    let result = state
        .backend()
        .delete_subscription(&name)
        .await
        .map(|()| Json(json!({})))
        .map_err(ApiError::from);
    record("DeleteSubscription", result)
}

async fn list_subscriptions(
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<RestState>,
) -> ApiResult<ListSubscriptionsResponse> {
    debug!("REST: ListSubscriptions {}", project);
    let result = async {
        let subscriptions = state.backend().list_subscriptions(&project).await?;
        let (page, next_page_token) = paginate(subscriptions, &query)?;
        Ok::<_, ApiError>(Json(ListSubscriptionsResponse {
            subscriptions: page.iter().map(Subscription::from).collect(),
            next_page_token,
        }))
    }
    .await;
    record("ListSubscriptions", result)
}

async fn pull(state: &RestState, subscription: &str, body: &Bytes) -> ApiResult<PullResponse> {
    let request: PullRequest = parse_required(body)?;
    if request.max_messages <= 0 {
        return Err(ApiError::bad_request(format!(
            "maxMessages must be positive, got {}",
            request.max_messages
        )));
    }
    debug!("REST: Pull up to {} from {}", request.max_messages, subscription);

    let received = state
        .backend()
        .pull(subscription, request.max_messages as u32)
        .await?;

    Ok(Json(PullResponse {
        received_messages: received
            .iter()
            .map(|r| ReceivedMessage {
                ack_id: r.ack_id.clone(),
                message: PubsubMessage::from(&r.message),
                delivery_attempt: Some(r.delivery_attempt as i32),
            })
            .collect(),
    }))
}

async fn acknowledge(state: &RestState, subscription: &str, body: &Bytes) -> ApiResult<Value> {
    let request: AcknowledgeRequest = parse_required(body)?;
    if request.ack_ids.is_empty() {
        return Err(ApiError::bad_request("ackIds must not be empty"));
    }
    debug!("REST: Acknowledge {} on {}", request.ack_ids.len(), subscription);

    state.backend().acknowledge(subscription, &request.ack_ids).await?;
    Ok(Json(json!({})))
}

async fn modify_ack_deadline(state: &RestState, subscription: &str, body: &Bytes) -> ApiResult<Value> {
    let request: ModifyAckDeadlineRequest = parse_required(body)?;
    let seconds = validate_ack_deadline(request.ack_deadline_seconds, true)?;
    debug!(
        "REST: ModifyAckDeadline {} on {} to {}s",
        request.ack_ids.len(),
        subscription,
        seconds
    );

    state
        .backend()
        .modify_ack_deadline(subscription, &request.ack_ids, seconds)
        .await?;
    Ok(Json(json!({})))
}

async fn modify_push_config(state: &RestState, subscription: &str, body: &Bytes) -> ApiResult<Value> {
    let request: ModifyPushConfigRequest = parse_required(body)?;
    let push_config = match request.push_config {
        Some(push) if !push.push_endpoint.is_empty() => Some(push.into_config()?),
        _ => None,
    };
    info!(
        "REST: ModifyPushConfig {} -> {}",
        subscription,
        push_config.as_ref().map(|p| p.endpoint.as_str()).unwrap_or("pull")
    );

    state.backend().modify_push_config(subscription, push_config).await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::push_queue::DeliveryQueue;
    use crate::storage::memory::InMemoryBackend;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let publisher = PublisherService::new(Arc::new(InMemoryBackend::new()), DeliveryQueue::new());
        create_router(RestState::new(publisher, 10), true)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_paginate() {
        let query = ListQuery {
            page_size: Some(2),
            page_token: None,
        };
        let (page, token) = paginate(vec![1, 2, 3], &query).unwrap();
        assert_eq!(page, vec![1, 2]);
        assert_eq!(token.as_deref(), Some("2"));

        let query = ListQuery {
            page_size: Some(2),
            page_token: token,
        };
        let (page, token) = paginate(vec![1, 2, 3], &query).unwrap();
        assert_eq!(page, vec![3]);
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn test_readiness() {
        let response = router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Ok");
    }

    #[tokio::test]
    async fn test_topic_lifecycle_and_errors() {
        let app = router();
        let topic_uri = "/v1/projects/test-project/topics/orders";

        let (status, body) = call(&app, "PUT", topic_uri, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "projects/test-project/topics/orders");

        let (status, body) = call(&app, "PUT", topic_uri, json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["status"], "ALREADY_EXISTS");
        assert_eq!(body["error"]["code"], 409);

        let (status, body) = call(&app, "GET", "/v1/projects/test-project/topics", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topics"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", topic_uri, Value::Null).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", topic_uri, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["status"], "NOT_FOUND");

        let (status, _) = call(&app, "PUT", "/v1/projects/test-project/topics/goog-nope", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_pull_acknowledge() {
        let app = router();
        call(&app, "PUT", "/v1/projects/test-project/topics/orders", json!({})).await;
        let (status, _) = call(
            &app,
            "PUT",
            "/v1/projects/test-project/subscriptions/orders-sub",
            json!({"topic": "projects/test-project/topics/orders"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/projects/test-project/topics/orders:publish",
            json!({"messages": [{"data": "aGVsbG8=", "attributes": {"k": "v"}}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messageIds"].as_array().unwrap().len(), 1);

        let pull_uri = "/v1/projects/test-project/subscriptions/orders-sub:pull";
        let (status, body) = call(&app, "POST", pull_uri, json!({"maxMessages": 10})).await;
        assert_eq!(status, StatusCode::OK);
        let received = body["receivedMessages"].as_array().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["message"]["data"], "aGVsbG8=");
        assert_eq!(received[0]["deliveryAttempt"], 1);
        let ack_id = received[0]["ackId"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            "POST",
            "/v1/projects/test-project/subscriptions/orders-sub:acknowledge",
            json!({"ackIds": [ack_id]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "POST", pull_uri, json!({"maxMessages": 10})).await;
        assert!(body.get("receivedMessages").is_none());
    }

    #[tokio::test]
    async fn test_subscription_errors() {
        let app = router();
        let (status, _) = call(
            &app,
            "PUT",
            "/v1/projects/test-project/subscriptions/orphan-sub",
            json!({"topic": "projects/test-project/topics/missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/projects/test-project/subscriptions/orphan-sub:pull",
            json!({"maxMessages": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/projects/test-project/subscriptions/orphan-sub:modifyAckDeadline",
            json!({"ackIds": ["x"], "ackDeadlineSeconds": 601}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["status"], "INVALID_ARGUMENT");

        let (status, _) = call(
            &app,
            "POST",
            "/v1/projects/test-project/subscriptions/orphan-sub:seek",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
