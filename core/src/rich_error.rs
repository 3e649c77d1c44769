//! Normalization of failures into caller-facing descriptions.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The structured part of a normalized failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFields {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl From<&Error> for ErrorFields {
    fn from(error: &Error) -> Self {
        match error.provider() {
            Some(provider) => Self {
                message: provider.message.clone(),
                json: provider.json.clone(),
                text: provider.text.clone(),
            },
            None => Self {
                message: error.to_string(),
                json: None,
                text: None,
            },
        }
    }
}

/// A failure rendered for an LLM or UI: a full message plus the fields it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichError {
    pub message: String,
    pub error: ErrorFields,
}

impl RichError {
    /// Builds the description of `error` raised while performing `action`.
    ///
    /// `args` are the parameters of the failed action and are echoed back
    /// as pretty JSON.
    pub fn new(action: &str, args: Option<&serde_json::Value>, error: &Error) -> Self {
        let fields = ErrorFields::from(error);
        let mut message = format!("Error during {}: {}", action, fields.message);
        if let Some(args) = args {
            message.push_str(&format!("\nParameters: {}", pretty(args)));
        }
        if let Some(json) = &fields.json {
            message.push_str(&format!("\nJSON: {}", pretty(json)));
        }
        if let Some(text) = &fields.text {
            message.push_str(&format!("\nText: {}", text));
        }
        Self {
            message,
            error: fields,
        }
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use serde_json::json;

    #[test]
    fn provider_errors_keep_payloads() {
        let err = Error::Execution(
            ProviderError::new("sandbox busy")
                .with_json(json!({ "status": 429 }))
                .with_text("Too Many Requests"),
        );

        let rich = RichError::new("wait for command to finish", None, &err);

        assert_eq!(rich.error.message, "sandbox busy");
        assert_eq!(rich.error.json, Some(json!({ "status": 429 })));
        assert_eq!(rich.error.text.as_deref(), Some("Too Many Requests"));
        assert!(rich.message.starts_with("Error during wait for command to finish: sandbox busy"));
        assert!(rich.message.contains("\nJSON: {\n  \"status\": 429\n}"));
        assert!(rich.message.ends_with("\nText: Too Many Requests"));
    }

    #[test]
    fn other_errors_fall_back_to_display() {
        let err = Error::Config("no dispatcher".to_string());

        let rich = RichError::new("start background command", None, &err);

        assert_eq!(rich.error.message, "configuration error: no dispatcher");
        assert_eq!(rich.error.json, None);
        assert_eq!(
            rich.message,
            "Error during start background command: configuration error: no dispatcher"
        );
    }

    #[test]
    fn parameters_are_echoed() {
        let err = Error::Connection("refused".into());
        let args = json!({ "sandboxId": "sb1" });

        let rich = RichError::new("connect to sandbox", Some(&args), &err);

        assert_eq!(
            rich.message,
            "Error during connect to sandbox: refused\nParameters: {\n  \"sandboxId\": \"sb1\"\n}"
        );
    }

    #[test]
    fn fields_serialize_without_empty_payloads() {
        let fields = ErrorFields::from(&Error::Storage("gone".into()));
        assert_eq!(serde_json::to_string(&fields).unwrap(), r#"{"message":"gone"}"#);
    }
}
