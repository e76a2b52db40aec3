use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use leadline_core::config::ServerConfig;

/// CORS for the chat widget.
///
/// Credentials are allowed so the session cookie travels cross-site. A `*`
/// entry mirrors the caller's origin, since browsers reject a literal
/// wildcard together with credentials.
pub fn build_cors_layer(server: &ServerConfig) -> CorsLayer {
    let wildcard = server.cors_allowed_origins.iter().any(|origin| origin.trim() == "*");
    let allow_origin = if wildcard {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = server
            .cors_allowed_origins
            .iter()
            .map(|origin| origin.trim().trim_end_matches('/'))
            .filter(|origin| !origin.is_empty())
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}
