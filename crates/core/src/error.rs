use thiserror::Error;

/// A stored enum token that no domain variant recognizes. `what` names the
/// domain type in error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: '{value}'")]
pub struct ParseError {
    pub what: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(what: &'static str, value: &str) -> Self {
        ParseError {
            what,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_the_type_and_token() {
        let err = ParseError::new("decision", "MAYBE");
        assert_eq!(err.to_string(), "unknown decision: 'MAYBE'");
    }
}
