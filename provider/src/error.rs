//! Error types for the provider.

/// Error types for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid setup. Fatal at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The backend could not be reached at all.
    #[error("{backend} not reachable: {message}")]
    BackendUnavailable { backend: &'static str, message: String },

    /// The backend answered with a non-success status.
    #[error("{backend} error (status {status}): {body}")]
    Backend {
        backend: &'static str,
        status: u16,
        body: String,
    },

    /// The backend answered with a body we could not decode.
    #[error("{backend} returned an invalid response: {message}")]
    BackendProtocol { backend: &'static str, message: String },

    /// The configured model is not served by the backend.
    #[error("{}", model_not_found_message(.model, .available))]
    ModelNotFound { model: String, available: Vec<String> },

    /// The gateway connection failed. Fatal to the session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Registration with the gateway failed. Fatal at startup.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Gateway REST API returned an error.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Gateway REST API answered with something we could not use.
    #[error("Hub error: {0}")]
    Hub(String),
}

fn model_not_found_message(model: &str, available: &[String]) -> String {
    if available.is_empty() {
        return format!(
            "model {:?} not found in ollama - no models available, run:\n  ollama pull {}",
            model, model
        );
    }
    format!(
        "model {:?} not found in ollama\n\nAvailable models:\n  {}\n\nTo pull it, run:\n  ollama pull {}",
        model,
        available.join("\n  "),
        model
    )
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_includes_body() {
        let err = Error::Backend {
            backend: "vllm",
            status: 500,
            body: "CUDA out of memory".to_string(),
        };
        assert_eq!(err.to_string(), "vllm error (status 500): CUDA out of memory");
    }

    #[test]
    fn test_model_not_found_lists_available() {
        let err = Error::ModelNotFound {
            model: "phi3".to_string(),
            available: vec!["llama3:latest".to_string(), "mistral".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("\"phi3\" not found"));
        assert!(msg.contains("llama3:latest\n  mistral"));
        assert!(msg.contains("ollama pull phi3"));
    }

    #[test]
    fn test_model_not_found_without_models() {
        let err = Error::ModelNotFound {
            model: "phi3".to_string(),
            available: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("no models available"));
        assert!(!msg.contains("Available models"));
    }
}
