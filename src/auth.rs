//! Tenant authentication and model gating.

use axum::http::{HeaderMap, header};

use crate::config::{Config, Tenant};
use crate::error::ProxyError;
use crate::wildcard;

/// Extract the client credential from a request.
///
/// Sources, in order: `Authorization: Bearer`, `Authorization: API-Key`,
/// `X-Api-Key` header, `api_key` query parameter.
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
        if let Some(token) = auth.strip_prefix("API-Key ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }

    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "api_key")
        .map(|(_, value)| value.into_owned())
}

/// Resolve the request's credential to an enabled tenant.
pub fn authenticate<'a>(
    config: &'a Config,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<&'a Tenant, ProxyError> {
    let credential = extract_credential(headers, query).ok_or(ProxyError::MissingAuth)?;

    let tenant = config
        .tenant_by_key(&credential)
        .ok_or(ProxyError::InvalidKey)?;

    if !tenant.enabled {
        return Err(ProxyError::TenantDisabled);
    }
    Ok(tenant)
}

/// Gate a requested model against the tenant's allow-list.
pub fn check_model_allowed(tenant: &Tenant, model: &str) -> Result<(), ProxyError> {
    let patterns = tenant.allowed_models.iter().map(String::as_str);
    if wildcard::find_first(patterns, model).is_some() {
        Ok(())
    } else {
        Err(ProxyError::ModelNotAllowed(model.to_string()))
    }
}

/// Pull the `model` field out of a JSON request body.
///
/// Returns None when the body is not valid JSON or has no model; the model
/// gate is skipped in that case (the upstream may still reject).
pub fn extract_model(body: &[u8]) -> Option<String> {
    let doc: serde_json::Value = serde_json::from_slice(body).ok()?;
    doc.get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdminConfig, LoadBalancerConfig, LoggingConfig, OpenAiConfig, ProxyConfig, ServerConfig,
        Upstream,
    };
    use axum::http::HeaderValue;

    fn config() -> Config {
        Config {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            openai: OpenAiConfig::default(),
            upstreams: vec![Upstream {
                id: "up-1".to_string(),
                name: "primary".to_string(),
                url: "https://api.anthropic.com".to_string(),
                key: None,
                weight: 100,
                enabled: true,
                health_check: None,
            }],
            load_balancer: LoadBalancerConfig::default(),
            tenants: vec![
                Tenant {
                    id: "acme".to_string(),
                    name: "Acme".to_string(),
                    key: "sk-acme".to_string(),
                    enabled: true,
                    allowed_models: vec!["*haiku*".to_string()],
                    limits: None,
                },
                Tenant {
                    id: "umbrella".to_string(),
                    name: "Umbrella".to_string(),
                    key: "sk-umbrella".to_string(),
                    enabled: false,
                    allowed_models: vec!["*".to_string()],
                    limits: None,
                },
            ],
            pricing: Vec::new(),
        }
    }

    #[test]
    fn extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_credential(&headers, Some("api_key=from-query")),
            Some("from-bearer".to_string())
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("API-Key from-scheme"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_credential(&headers, None),
            Some("from-scheme".to_string())
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_credential(&headers, Some("api_key=from-query")),
            Some("from-header".to_string())
        );

        let headers = HeaderMap::new();
        assert_eq!(
            extract_credential(&headers, Some("other=1&api_key=from-query")),
            Some("from-query".to_string())
        );
        assert_eq!(extract_credential(&headers, None), None);
    }

    #[test]
    fn authenticate_failures_are_distinct() {
        let config = config();
        let headers = HeaderMap::new();

        let err = authenticate(&config, &headers, None).unwrap_err();
        assert_eq!(err.kind(), "missing_auth");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-wrong"));
        let err = authenticate(&config, &headers, None).unwrap_err();
        assert_eq!(err.kind(), "invalid_key");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-umbrella"));
        let err = authenticate(&config, &headers, None).unwrap_err();
        assert_eq!(err.kind(), "tenant_disabled");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-acme"));
        let tenant = authenticate(&config, &headers, None).unwrap();
        assert_eq!(tenant.id, "acme");
    }

    #[test]
    fn model_gate() {
        let config = config();
        let tenant = &config.tenants[0];
        assert!(check_model_allowed(tenant, "claude-3-5-haiku-20241022").is_ok());
        let err = check_model_allowed(tenant, "claude-sonnet-4-20250514").unwrap_err();
        assert_eq!(err.kind(), "model_not_allowed");
    }

    #[test]
    fn model_extraction() {
        assert_eq!(
            extract_model(br#"{"model":"claude-sonnet-4-20250514","messages":[]}"#),
            Some("claude-sonnet-4-20250514".to_string())
        );
        assert_eq!(extract_model(br#"{"messages":[]}"#), None);
        assert_eq!(extract_model(b"not json"), None);
    }
}
