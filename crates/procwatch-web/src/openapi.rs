//! OpenAPI documentation definition.

use procwatch_core::query::MetricPoint;
use procwatch_core::watch::WatchState;
use utoipa::OpenApi;

use crate::handlers::{ErrorBody, PidInfo, WatchStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_pids,
        crate::handlers::handle_metrics,
        crate::handlers::handle_watch,
    ),
    components(schemas(MetricPoint, PidInfo, WatchStatus, WatchState, ErrorBody)),
    info(
        title = "procwatch API",
        version = "1.0",
        description = "Per-process resource metrics with CPU rates derived from cumulative counters"
    )
)]
pub(crate) struct ApiDoc;
