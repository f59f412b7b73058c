use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;

use crate::db::{ConversationFilter, ConversationStatus, SenderType, TicketPriority};
use crate::routing::EscalationRequest;
use crate::tenant::Tenant;
use crate::web::WebState;
use crate::web::handlers::{
    render_error, render_routing_error, render_tenant_error, state_or_unavailable,
};

#[derive(Debug, Deserialize)]
struct ClaimBody {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct EscalateBody {
    reason: Option<String>,
    priority: Option<TicketPriority>,
    subject: Option<String>,
    assign_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    sender_type: SenderType,
    sender_id: Option<i64>,
    body: String,
}

/// Resolves the state, the company in the path and, when `with_id`, the
/// conversation id. Renders the error response itself on failure.
async fn admin_target(
    req: &mut Request,
    res: &mut Response,
    with_id: bool,
) -> Option<(&'static WebState, Tenant, i64)> {
    let state = state_or_unavailable(res)?;
    let Some(company_id) = req.param::<i64>("company_id") else {
        render_error(res, StatusCode::BAD_REQUEST, "company id must be numeric");
        return None;
    };
    let conversation_id = if with_id {
        match req.param::<i64>("id") {
            Some(id) => id,
            None => {
                render_error(res, StatusCode::BAD_REQUEST, "conversation id must be numeric");
                return None;
            }
        }
    } else {
        0
    };
    match state.tenants.for_company(company_id).await {
        Ok(tenant) => Some((state, tenant, conversation_id)),
        Err(err) => {
            render_tenant_error(res, &err);
            None
        }
    }
}

async fn json_body<T: for<'de> Deserialize<'de>>(req: &mut Request, res: &mut Response) -> Option<T> {
    match req.parse_json::<T>().await {
        Ok(body) => Some(body),
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid body: {}", err));
            None
        }
    }
}

#[handler]
pub async fn list_conversations(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, _)) = admin_target(req, res, false).await else {
        return;
    };
    let status = match req.query::<String>("status") {
        None => None,
        Some(raw) => match raw.parse::<ConversationStatus>() {
            Ok(status) => Some(status),
            Err(_) => {
                render_error(res, StatusCode::BAD_REQUEST, &format!("unknown status {}", raw));
                return;
            }
        },
    };
    let filter = ConversationFilter {
        status,
        channel_id: req.query::<i64>("channel_id"),
        contact_id: req.query::<i64>("contact_id"),
        limit: req.query::<i64>("limit").unwrap_or(50).clamp(1, 500),
        offset: req.query::<i64>("offset").unwrap_or(0).max(0),
    };

    match state.core.list_conversations(&tenant, &filter).await {
        Ok(conversations) => {
            res.render(Json(json!({
                "conversations": conversations,
                "count": conversations.len(),
                "limit": filter.limit,
                "offset": filter.offset,
            })));
        }
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn get_conversation(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    let limit = req.query::<i64>("limit").unwrap_or(100);
    let offset = req.query::<i64>("offset").unwrap_or(0);

    match state.core.conversation_detail(&tenant, id, limit, offset).await {
        Ok(detail) => res.render(Json(detail)),
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn claim_conversation(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    let Some(body) = json_body::<ClaimBody>(req, res).await else {
        return;
    };
    match state.core.claim(&tenant, id, body.user_id).await {
        Ok(conversation) => res.render(Json(conversation)),
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn release_conversation(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    match state.core.release(&tenant, id).await {
        Ok(conversation) => res.render(Json(conversation)),
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn close_conversation(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    match state.core.close(&tenant, id).await {
        Ok(conversation) => res.render(Json(conversation)),
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn escalate_conversation(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    let Some(body) = json_body::<EscalateBody>(req, res).await else {
        return;
    };
    let request = EscalationRequest {
        reason: body.reason,
        priority: body.priority,
        subject: body.subject,
        assign_to: body.assign_to,
    };
    match state.core.escalate(&tenant, id, &request).await {
        Ok(ticket) => {
            res.status_code(StatusCode::CREATED);
            res.render(Json(ticket));
        }
        Err(err) => render_routing_error(res, &err),
    }
}

#[handler]
pub async fn post_message(req: &mut Request, res: &mut Response) {
    let Some((state, tenant, id)) = admin_target(req, res, true).await else {
        return;
    };
    let Some(body) = json_body::<MessageBody>(req, res).await else {
        return;
    };
    match state
        .core
        .post_message(&tenant, id, body.sender_type, body.sender_id, &body.body)
        .await
    {
        Ok(message) => {
            res.status_code(StatusCode::CREATED);
            res.render(Json(message));
        }
        Err(err) => render_routing_error(res, &err),
    }
}
