//! Error classification shared by the circuit breaker, retry fabric and
//! recovery strategies (C2). Classification is by substring inspection of the
//! rendered error, not by downcasting — the LLM client, the HTTP feed client
//! and the DB pool all surface plain `anyhow::Error`s from different crates,
//! so there is no single concrete error type to match on.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    ParseError,
    AuthError,
    Network,
    Database,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::Network => "network",
            ErrorKind::Database => "database",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify an error by substring match over its rendered message
    /// (`{:#}` so the full `anyhow` context chain is inspected).
    pub fn classify(err: &anyhow::Error) -> Self {
        let text = format!("{:#}", err).to_lowercase();
        Self::classify_str(&text)
    }

    pub fn classify_str(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.contains("429") || text.contains("rate limit") || text.contains("too many requests")
        {
            ErrorKind::RateLimit
        } else if text.contains("500") || text.contains("502") || text.contains("503") {
            ErrorKind::ServerError
        } else if text.contains("timeout") || text.contains("timed out") {
            ErrorKind::Timeout
        } else if text.contains("parse") || text.contains("json") || text.contains("deserialize") {
            ErrorKind::ParseError
        } else if text.contains("auth") || text.contains("401") || text.contains("403") {
            ErrorKind::AuthError
        } else if text.contains("database") || text.contains("sqlx") || text.contains("postgres")
        {
            ErrorKind::Database
        } else if text.contains("connection") || text.contains("network") || text.contains("dns") {
            ErrorKind::Network
        } else {
            ErrorKind::Unknown
        }
    }

    pub fn is_recoverable(&self, recoverable: &[ErrorKind]) -> bool {
        recoverable.contains(self)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Running per-kind error statistics for a named circuit breaker, surfaced
/// via the metrics registry (C9) rather than only the bare breaker state.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_kind: std::collections::HashMap<&'static str, u64>,
    pub consecutive_errors: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
}

impl ErrorStats {
    pub fn record_error(&mut self, kind: ErrorKind) {
        self.total_errors += 1;
        self.consecutive_errors += 1;
        *self.errors_by_kind.entry(kind.as_str()).or_insert(0) += 1;
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn record_recovery_attempt(&mut self, succeeded: bool) {
        self.recovery_attempts += 1;
        if succeeded {
            self.successful_recoveries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_substrings() {
        assert_eq!(ErrorKind::classify_str("429 Too Many Requests"), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::classify_str("upstream returned 503"), ErrorKind::ServerError);
        assert_eq!(ErrorKind::classify_str("request timed out after 30s"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify_str("failed to parse JSON body"), ErrorKind::ParseError);
        assert_eq!(ErrorKind::classify_str("401 unauthorized: bad api key"), ErrorKind::AuthError);
        assert_eq!(ErrorKind::classify_str("sqlx pool closed"), ErrorKind::Database);
        assert_eq!(ErrorKind::classify_str("dns resolution failed"), ErrorKind::Network);
        assert_eq!(ErrorKind::classify_str("something unrelated happened"), ErrorKind::Unknown);
    }

    #[test]
    fn error_stats_tracks_consecutive_and_totals() {
        let mut stats = ErrorStats::default();
        stats.record_error(ErrorKind::Timeout);
        stats.record_error(ErrorKind::Timeout);
        assert_eq!(stats.consecutive_errors, 2);
        assert_eq!(stats.total_errors, 2);
        stats.record_success();
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.total_errors, 2);
    }
}
