//! Client configuration.

use std::time::Duration;

use bindwire_core::DEFAULT_CONTENT_TYPE;

/// Top-level client configuration.
///
/// Plain struct with defaults; loading it from files or the environment is
/// left to the embedding application.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Content type used when neither the message nor the document declares one.
    pub default_content_type: String,
    /// Upper bound on establishing a native connection.
    pub connect_timeout: Duration,
    /// Upper bound on opening a native consumer.
    pub subscribe_timeout: Duration,
    /// Upper bound on a single native publish.
    pub publish_timeout: Duration,
    /// Validate outbound payloads against the selected message schema.
    pub validate_outbound: bool,
    /// Generate a UUID when a header-sourced correlation id is missing.
    pub generate_correlation_ids: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(30),
            validate_outbound: true,
            generate_correlation_ids: true,
        }
    }
}
