use axum::http::HeaderMap;

use genflow_core::{TenantId, UserId};
use genflow_infra::RequestContext;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const EMAIL_HEADER: &str = "x-user-email";
pub const ROLE_HEADER: &str = "x-user-role";

/// Why the identity headers were rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    MissingTenant,
    InvalidHeader(&'static str),
}

impl ContextError {
    pub fn message(&self) -> String {
        match self {
            ContextError::MissingTenant => format!("missing {TENANT_HEADER} header"),
            ContextError::InvalidHeader(name) => format!("invalid {name} header"),
        }
    }
}

/// Build the request context from the headers set by the auth gateway.
///
/// The tenant header is mandatory; the others are optional but must be
/// well-formed when present.
pub fn from_headers(headers: &HeaderMap) -> Result<RequestContext, ContextError> {
    let tenant = header(headers, TENANT_HEADER)?.ok_or(ContextError::MissingTenant)?;
    let tenant_id: TenantId = tenant
        .parse()
        .map_err(|_| ContextError::InvalidHeader(TENANT_HEADER))?;

    let mut ctx = RequestContext::for_tenant(tenant_id);
    if let Some(user) = header(headers, USER_HEADER)? {
        let user_id: UserId = user.parse().map_err(|_| ContextError::InvalidHeader(USER_HEADER))?;
        ctx = ctx.with_user(user_id);
    }
    if let Some(email) = header(headers, EMAIL_HEADER)? {
        ctx = ctx.with_email(email);
    }
    if let Some(role) = header(headers, ROLE_HEADER)? {
        ctx = ctx.with_role(role);
    }
    Ok(ctx)
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, ContextError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| ContextError::InvalidHeader(name))?.trim();
            Ok((!value.is_empty()).then_some(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn tenant_header_is_required() {
        let headers = HeaderMap::new();
        assert_eq!(from_headers(&headers), Err(ContextError::MissingTenant));

        let mut blank = HeaderMap::new();
        blank.insert(TENANT_HEADER, HeaderValue::from_static("  "));
        assert_eq!(from_headers(&blank), Err(ContextError::MissingTenant));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));
        assert_eq!(from_headers(&headers), Err(ContextError::InvalidHeader(TENANT_HEADER)));

        let tenant = TenantId::new();
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_str(&tenant.to_string()).unwrap());
        headers.insert(USER_HEADER, HeaderValue::from_static("bob"));
        assert_eq!(from_headers(&headers), Err(ContextError::InvalidHeader(USER_HEADER)));
    }

    #[test]
    fn all_identity_headers_are_carried() {
        let (tenant, user) = (TenantId::new(), UserId::new());
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_str(&tenant.to_string()).unwrap());
        headers.insert(USER_HEADER, HeaderValue::from_str(&user.to_string()).unwrap());
        headers.insert(EMAIL_HEADER, HeaderValue::from_static("ops@example.com"));
        headers.insert(ROLE_HEADER, HeaderValue::from_static("admin"));

        let ctx = from_headers(&headers).unwrap();
        assert_eq!(ctx.tenant_id, Some(tenant));
        assert_eq!(ctx.user_id, Some(user));
        assert_eq!(ctx.email.as_deref(), Some("ops@example.com"));
        assert_eq!(ctx.role.as_deref(), Some("admin"));
    }
}
