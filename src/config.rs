#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub model: String,
    pub temperature: f64,
    /// None disables telemetry.
    pub literal_api_key: Option<String>,
    pub literal_url: String,
    pub participant: String,
    pub timeout: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            literal_api_key: None,
            literal_url: "https://cloud.getliteral.ai".to_string(),
            participant: "chat-relay".to_string(),
            timeout: 600,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("temperature must be within [0, 2], got {}", self.temperature);
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("model must not be empty");
        }
        if self.timeout == 0 {
            anyhow::bail!("timeout must be at least one second");
        }
        if self.participant.trim().is_empty() {
            anyhow::bail!("participant must not be empty");
        }
        Ok(())
    }

    pub fn telemetry_enabled(&self) -> bool {
        self.literal_api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }
}
