use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing,
};
use hashed_short::{
    config,
    url_service::{self, ResolveError, ShortenError, url_shortener_service_capsule},
};
use rearch::Container;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let app = Router::new()
        .route("/", routing::post(shorten_url))
        .route("/{code}", routing::get(resolve_url))
        .route("/{code}/stats", routing::get(url_stats))
        .with_state(container.clone());

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument(skip(container))]
async fn shorten_url(
    State(container): State<Container>,
    Json(url_service::ShortenUrlPayload { url }): Json<url_service::ShortenUrlPayload>,
) -> impl IntoResponse {
    let (service, base_url) =
        container.read((url_shortener_service_capsule, config::base_url_capsule));
    service
        .shorten(&url)
        .await
        .map_err(|error: ShortenError| {
            let err_uuid = Uuid::new_v4();
            match error {
                ShortenError::InvalidInput => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    error_response(StatusCode::BAD_REQUEST, error.to_string(), err_uuid)
                }
                ShortenError::GenerationExhausted => {
                    error!(?err_uuid, ?error, "Could not find a free short code");
                    error_response(StatusCode::SERVICE_UNAVAILABLE, error.to_string(), err_uuid)
                }
                ShortenError::StorageUnavailable(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error_response(err_uuid)
                }
            }
        })
        .and_then(|shortened| {
            let short_url = base_url.join(&shortened.short_code).map_err(|err| {
                let err_uuid = Uuid::new_v4();
                error!(?err_uuid, ?err, "Failed to compose short URL");
                internal_error_response(err_uuid)
            })?;
            Ok((
                StatusCode::CREATED,
                Json(ShortUrl {
                    short_url: short_url.into(),
                    short_code: shortened.short_code,
                    normalized_url: shortened.normalized_url,
                    clicks: shortened.clicks,
                }),
            ))
        })
}

#[instrument(skip(container))]
async fn resolve_url(
    State(container): State<Container>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    container
        .read(url_shortener_service_capsule)
        .resolve(&code)
        .await
        .map(|url| Redirect::temporary(&url))
        .map_err(resolve_error_response)
}

#[instrument(skip(container))]
async fn url_stats(
    State(container): State<Container>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    container
        .read(url_shortener_service_capsule)
        .stats(&code)
        .await
        .map(Json)
        .map_err(resolve_error_response)
}

fn resolve_error_response(error: ResolveError) -> (StatusCode, Json<Error>) {
    let err_uuid = Uuid::new_v4();
    match error {
        ResolveError::NotFound => {
            error_response(StatusCode::NOT_FOUND, "Not found".to_owned(), err_uuid)
        }
        ResolveError::StorageUnavailable(_) | ResolveError::Internal(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error_response(err_uuid)
        }
    }
}

fn internal_error_response(err_uuid: Uuid) -> (StatusCode, Json<Error>) {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_owned(),
        err_uuid,
    )
}

fn error_response(status: StatusCode, error: String, err_uuid: Uuid) -> (StatusCode, Json<Error>) {
    (
        status,
        Json(Error {
            error,
            error_id: err_uuid.to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct ShortUrl {
    short_code: String,
    short_url: String,
    normalized_url: String,
    clicks: u64,
}

#[derive(Serialize)]
pub struct Error {
    error: String,
    error_id: String,
}
