use salvo::prelude::*;
use serde_json::json;

use crate::routing::RoutingError;
use crate::tenant::TenantError;
use crate::web::{WebState, web_state};

pub mod conversations;
pub mod health;
pub mod metrics;
pub mod webhooks;

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

/// Renders 503 when the server state is not installed yet.
pub(crate) fn state_or_unavailable(res: &mut Response) -> Option<&'static WebState> {
    let state = web_state();
    if state.is_none() {
        render_error(res, StatusCode::SERVICE_UNAVAILABLE, "server is starting");
    }
    state
}

pub(crate) fn routing_status(err: &RoutingError) -> StatusCode {
    match err {
        RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
        RoutingError::InvalidTransition(_) | RoutingError::ChannelInactive(_) => {
            StatusCode::CONFLICT
        }
        RoutingError::Malformed(_) => StatusCode::BAD_REQUEST,
        RoutingError::TenantMismatch { .. } => StatusCode::NOT_FOUND,
        RoutingError::Database(err) if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        RoutingError::Database(_) | RoutingError::TicketNumberExhausted { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn render_routing_error(res: &mut Response, err: &RoutingError) {
    render_error(res, routing_status(err), &err.to_string());
}

pub(crate) fn render_tenant_error(res: &mut Response, err: &TenantError) {
    let status = match err {
        TenantError::UnknownCompany(_) | TenantError::UnknownChannel(_) => StatusCode::NOT_FOUND,
        TenantError::Mismatch { .. } => StatusCode::NOT_FOUND,
        TenantError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    render_error(res, status, &err.to_string());
}

#[cfg(test)]
mod tests {
    use salvo::http::StatusCode;
    use test_case::test_case;

    use super::routing_status;
    use crate::db::{ConversationStatus, DatabaseError};
    use crate::routing::{InvalidTransition, RoutingError};

    #[test_case(RoutingError::NotFound("conversation 7".into()), StatusCode::NOT_FOUND; "not found")]
    #[test_case(RoutingError::Malformed("empty".into()), StatusCode::BAD_REQUEST; "malformed")]
    #[test_case(RoutingError::ChannelInactive(3), StatusCode::CONFLICT; "inactive channel")]
    #[test_case(
        RoutingError::InvalidTransition(InvalidTransition { from: ConversationStatus::Open, transition: "close" }),
        StatusCode::CONFLICT;
        "invalid transition"
    )]
    #[test_case(RoutingError::Database(DatabaseError::Connection("down".into())), StatusCode::SERVICE_UNAVAILABLE; "transient db")]
    #[test_case(RoutingError::TicketNumberExhausted { attempts: 5 }, StatusCode::INTERNAL_SERVER_ERROR; "exhausted")]
    fn maps_routing_errors(err: RoutingError, expected: StatusCode) {
        assert_eq!(routing_status(&err), expected);
    }
}
