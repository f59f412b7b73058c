use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::web::handlers::{
    conversations::{
        claim_conversation, close_conversation, escalate_conversation, get_conversation,
        list_conversations, post_message, release_conversation,
    },
    health::{get_status, health_check},
    metrics::metrics,
    render_error, state_or_unavailable,
    webhooks::{receive_webhook, verify_webhook},
};

/// Extracts the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[handler]
pub async fn require_admin(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let Some(state) = state_or_unavailable(res) else {
        ctrl.skip_rest();
        return;
    };
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let authorized = bearer_token(header)
        .is_some_and(|token| token == state.admin_token.expose_secret());
    if !authorized {
        warn!("rejected admin request to {}", req.uri().path());
        render_error(res, StatusCode::UNAUTHORIZED, "missing or invalid admin token");
        ctrl.skip_rest();
    }
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics))
        .push(Router::with_path("status").get(get_status))
        .push(
            Router::with_path("webhooks/{channel_id}")
                .get(verify_webhook)
                .post(receive_webhook),
        )
        .push(
            Router::with_path("api/companies/{company_id}/conversations")
                .hoop(require_admin)
                .get(list_conversations)
                .push(Router::with_path("{id}").get(get_conversation))
                .push(Router::with_path("{id}/claim").post(claim_conversation))
                .push(Router::with_path("{id}/release").post(release_conversation))
                .push(Router::with_path("{id}/close").post(close_conversation))
                .push(Router::with_path("{id}/escalate").post(escalate_conversation))
                .push(
                    Router::with_path("{id}/messages")
                        .get(get_conversation)
                        .post(post_message),
                ),
        )
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::bearer_token;

    #[test_case(Some("Bearer s3cret"), Some("s3cret"); "standard")]
    #[test_case(Some("bearer  s3cret "), Some("s3cret"); "lowercase and padded")]
    #[test_case(Some("Basic abc"), None; "other scheme")]
    #[test_case(Some("Bearer "), None; "empty token")]
    #[test_case(Some("s3cret"), None; "no scheme")]
    #[test_case(None, None; "missing")]
    fn parses_bearer_tokens(header: Option<&str>, expected: Option<&str>) {
        assert_eq!(bearer_token(header), expected);
    }
}
