/// Sanitize an identifier into `[a-z0-9_-]+`: ASCII alphanumerics are
/// lowercased, `-` and `_` pass through, every other byte becomes `_`.
pub fn sanitize_id(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else if c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if mapped.is_empty() { "_".to_string() } else { mapped }
}
