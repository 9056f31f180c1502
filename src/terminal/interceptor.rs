//! Routed-command classification.
//!
//! Each line of terminal input is classified exactly once: either its first
//! token matches a configured routed prefix (execute on the paired local
//! agent) or it passes through unchanged to the local-shell mechanism.
//! Classification itself has no side effects; the caller performs the single
//! enqueue-or-reject action.

/// How a line of terminal input should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// First token matched a routed prefix — execute via the bridge.
    Routed,
    /// Forward unchanged to the local-shell passthrough.
    Passthrough,
}

/// Classifies terminal input against a configured set of routed prefixes.
#[derive(Clone, Debug)]
pub struct Interceptor {
    routed_prefixes: Vec<String>,
}

impl Interceptor {
    #[must_use]
    pub fn new(routed_prefixes: Vec<String>) -> Self {
        Self { routed_prefixes }
    }

    /// Classify one line of input by its first whitespace-delimited token.
    ///
    /// The match is exact on the whole token: `claude hello` routes when
    /// `claude` is configured, `claudette` does not.
    #[must_use]
    pub fn classify(&self, line: &str) -> Classification {
        let Some(first_token) = line.split_whitespace().next() else {
            return Classification::Passthrough;
        };
        if self.routed_prefixes.iter().any(|p| p == first_token) {
            Classification::Routed
        } else {
            Classification::Passthrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor() -> Interceptor {
        Interceptor::new(vec!["claude".to_string(), "gemini".to_string()])
    }

    #[test]
    fn test_routed_prefix() {
        assert_eq!(interceptor().classify("claude hello"), Classification::Routed);
        assert_eq!(interceptor().classify("gemini --help"), Classification::Routed);
        assert_eq!(interceptor().classify("claude"), Classification::Routed);
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(interceptor().classify("ls -la"), Classification::Passthrough);
        assert_eq!(interceptor().classify("echo claude"), Classification::Passthrough);
    }

    #[test]
    fn test_prefix_is_whole_token() {
        assert_eq!(
            interceptor().classify("claudette hi"),
            Classification::Passthrough
        );
    }

    #[test]
    fn test_leading_whitespace_and_empty() {
        assert_eq!(interceptor().classify("   claude hi"), Classification::Routed);
        assert_eq!(interceptor().classify(""), Classification::Passthrough);
        assert_eq!(interceptor().classify("   "), Classification::Passthrough);
    }
}
