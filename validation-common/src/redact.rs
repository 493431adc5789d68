//! Token redaction, shared by the Sandbox Runner's serial-log tailer and
//! by the startup config dump. A job's short-lived access token must
//! never reach a persisted log (spec §3 invariant).

/// Replaces every occurrence of `token` in `text` with a fixed-width
/// placeholder. Used on every line written to a job log file.
pub fn redact_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, "****REDACTED****")
}

/// Redacts a whole set of known-secret substrings in one pass, in the
/// order given. Longer secrets should come first so a prefix-sharing
/// shorter one doesn't partially mask it first.
pub fn redact_all(text: &str, secrets: &[&str]) -> String {
    let mut result = text.to_string();
    for secret in secrets {
        result = redact_token(&result, secret);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_every_occurrence() {
        let text = "token=abc123 request with abc123 repeated";
        let redacted = redact_token(text, "abc123");
        assert!(!redacted.contains("abc123"));
        assert_eq!(redacted.matches("****REDACTED****").count(), 2);
    }

    #[test]
    fn empty_token_is_a_no_op() {
        let text = "nothing to redact here";
        assert_eq!(redact_token(text, ""), text);
    }
}
