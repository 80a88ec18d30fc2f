//! Actor context extraction.
//!
//! Identity is established upstream; the gateway in front of this service
//! forwards the caller as `X-Actor-ID`, `X-Actor-Role` and, for guardians and
//! students, the comma-separated `X-Student-IDs` they may act for.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use service_core::middleware::RequestMeta;
use uuid::Uuid;

use crate::services::{ActorContext, ActorRole};

pub const ACTOR_ID_HEADER: &str = "X-Actor-ID";
pub const ACTOR_ROLE_HEADER: &str = "X-Actor-Role";
pub const STUDENT_IDS_HEADER: &str = "X-Student-IDs";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_student_ids(raw: &str) -> Result<Vec<Uuid>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Uuid>().map_err(|_| {
                AppError::BadRequest(anyhow::anyhow!("Invalid student id '{}' in {}", s, STUDENT_IDS_HEADER))
            })
        })
        .collect()
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = header(parts, ACTOR_ID_HEADER)
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing {} header", ACTOR_ID_HEADER))
            })?
            .parse::<Uuid>()
            .map_err(|_| {
                AppError::Unauthorized(anyhow::anyhow!("Invalid {} header", ACTOR_ID_HEADER))
            })?;

        let role = header(parts, ACTOR_ROLE_HEADER)
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing {} header", ACTOR_ROLE_HEADER))
            })?
            .parse::<ActorRole>()
            .map_err(|e| AppError::Unauthorized(anyhow::anyhow!(e)))?;

        let student_ids = match header(parts, STUDENT_IDS_HEADER) {
            Some(raw) => parse_student_ids(raw)?,
            None => Vec::new(),
        };

        let meta = parts.extensions.get::<RequestMeta>();

        let span = tracing::Span::current();
        span.record("actor_id", tracing::field::display(actor_id));
        span.record("actor_role", role.as_str());

        Ok(ActorContext {
            actor_id,
            role,
            student_ids,
            ip: meta.and_then(|m| m.client_ip),
            request_id: meta.map(|m| m.request_id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<ActorContext, AppError> {
        let (mut parts, _) = request.into_parts();
        ActorContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_guardian_headers() {
        let actor = Uuid::new_v4();
        let child_a = Uuid::new_v4();
        let child_b = Uuid::new_v4();
        let request = Request::builder()
            .header(ACTOR_ID_HEADER, actor.to_string())
            .header(ACTOR_ROLE_HEADER, "parent")
            .header(STUDENT_IDS_HEADER, format!("{child_a}, {child_b}"))
            .body(())
            .unwrap();

        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.actor_id, actor);
        assert_eq!(ctx.role, ActorRole::Guardian);
        assert_eq!(ctx.student_ids, vec![child_a, child_b]);
        assert!(!ctx.is_staff());
    }

    #[tokio::test]
    async fn test_missing_actor_is_unauthorized() {
        let request = Request::builder()
            .header(ACTOR_ROLE_HEADER, "staff")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_student_id_is_rejected() {
        let request = Request::builder()
            .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
            .header(ACTOR_ROLE_HEADER, "guardian")
            .header(STUDENT_IDS_HEADER, "not-a-uuid")
            .body(())
            .unwrap();
        assert!(matches!(extract(request).await, Err(AppError::BadRequest(_))));
    }
}
