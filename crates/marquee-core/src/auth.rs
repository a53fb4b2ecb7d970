//! Reference [`AuthResolver`] backed by static bearer tokens from the config.

use std::collections::HashMap;

use async_trait::async_trait;
use http::{header, request::Parts};

use crate::config::AuthToken;
use crate::contracts::{AuthResolver, Caller};

#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    tokens: HashMap<String, Caller>,
}

impl TokenAuth {
    pub fn new(tokens: &[AuthToken]) -> Self {
        let tokens = tokens
            .iter()
            .map(|token| {
                let caller = Caller {
                    user_id: token.user_id.clone(),
                    is_admin: token.admin,
                };
                (token.token.clone(), caller)
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl AuthResolver for TokenAuth {
    async fn resolve(&self, request: &Parts) -> Option<Caller> {
        let value = request.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        self.tokens.get(token.trim()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/plugins/demo/status");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn auth() -> TokenAuth {
        TokenAuth::new(&[
            AuthToken {
                token: "user-token".into(),
                user_id: "alice".into(),
                admin: false,
            },
            AuthToken {
                token: "admin-token".into(),
                user_id: "root".into(),
                admin: true,
            },
        ])
    }

    #[tokio::test]
    async fn bearer_tokens_resolve_to_callers() {
        let auth = auth();
        assert_eq!(
            auth.resolve(&parts(Some("Bearer user-token"))).await,
            Some(Caller::user("alice"))
        );
        assert_eq!(
            auth.resolve(&parts(Some("bearer admin-token"))).await,
            Some(Caller::admin("root"))
        );
    }

    #[tokio::test]
    async fn unknown_or_missing_credentials_resolve_to_nobody() {
        let auth = auth();
        assert_eq!(auth.resolve(&parts(None)).await, None);
        assert_eq!(auth.resolve(&parts(Some("Bearer nope"))).await, None);
        assert_eq!(auth.resolve(&parts(Some("Basic user-token"))).await, None);
    }
}
