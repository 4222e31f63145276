use uploadflow_auth::{JwtClaims, Role};
use uploadflow_core::IdGenerator;
use uploadflow_events::trace::ensure_correlation_id;

/// Principal context for a request (authenticated identity + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: String,
    user_name: String,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            roles,
        }
    }

    pub fn from_claims(claims: JwtClaims) -> Self {
        Self::new(claims.sub, claims.name, claims.roles)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }
}

/// Correlation id of the current request.
///
/// `supplied` is the trimmed `x-correlation-id` request header, if any;
/// `effective` is that value or a freshly generated id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCorrelation {
    supplied: Option<String>,
    effective: String,
}

impl RequestCorrelation {
    pub fn resolve(header: Option<&str>, ids: &dyn IdGenerator) -> Self {
        let supplied = header
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let effective = ensure_correlation_id(supplied.as_deref(), ids);
        Self { supplied, effective }
    }

    pub fn supplied(&self) -> Option<&str> {
        self.supplied.as_deref()
    }

    pub fn effective(&self) -> &str {
        &self.effective
    }
}
