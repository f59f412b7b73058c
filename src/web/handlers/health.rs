use salvo::prelude::*;
use serde_json::json;

use crate::web::handlers::{render_error, state_or_unavailable};

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

/// Uptime plus the number of stored webhook events not yet processed.
#[handler]
pub async fn get_status(res: &mut Response) {
    let Some(state) = state_or_unavailable(res) else {
        return;
    };
    match state
        .db_manager
        .webhook_store()
        .count_unprocessed_unscoped()
        .await
    {
        Ok(backlog) => {
            res.render(Json(json!({
                "status": "running",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": state.started_at.elapsed().as_secs(),
                "database": state.db_manager.db_type().as_str(),
                "webhook_backlog": backlog,
            })));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("database error: {}", err),
            );
        }
    }
}
