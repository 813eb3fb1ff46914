use serde::{Deserialize, Serialize};

/// Machine-readable body of every terminal error response: `{"error": "<kind>"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(kind: &str) -> Self {
        Self { error: kind.to_string() }
    }
}

/// Public download link for a token: `{base}/{token}`, or
/// `{base}/{token}/{name}` when a display name is known. The trailing name
/// is cosmetic; lookups only use the token.
pub fn link_url(base_url: &str, token: &str, file_name: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match file_name.filter(|n| !n.is_empty()) {
        Some(name) => format!("{}/{}/{}", base, token, urlencoding::encode(name)),
        None => format!("{}/{}", base, token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_url() {
        assert_eq!(link_url("http://localhost:8080/", "abc", None), "http://localhost:8080/abc");
        assert_eq!(
            link_url("https://dl.example.com", "abc", Some("my report.pdf")),
            "https://dl.example.com/abc/my%20report.pdf"
        );
        assert_eq!(link_url("https://dl.example.com", "abc", Some("")), "https://dl.example.com/abc");
    }

    #[test]
    fn test_error_body_json() {
        let json = serde_json::to_string(&ErrorBody::new("expired")).unwrap();
        assert_eq!(json, r#"{"error":"expired"}"#);
    }
}
