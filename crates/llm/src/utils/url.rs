use std::fmt::Display;

/// Join a base URL and an endpoint path with exactly one `/` between them.
pub fn create_model_url(base_url: impl Display, api_url: impl Display) -> String {
    let base = base_url.to_string();
    let path = api_url.to_string();
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
