use thiserror::Error;

/// Failures of the action grammar. Fatal to the current model response only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GrammarError {
    #[error("no Action section in model output")]
    MissingActionSection,

    #[error("type(content='...') pattern not found in: {0}")]
    MissingTypeContent(String),

    #[error("action can't parse: {candidate} ({reason})")]
    ActionParse { candidate: String, reason: String },

    #[error("bad coordinate '{value}' in {param} of '{candidate}'")]
    BadCoordinate { candidate: String, param: String, value: String },
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Grammar error: {0}")]
    Grammar(#[from] GrammarError),

    #[error("absolute aspect ratio must be smaller than 200, got {ratio}")]
    AspectRatio { ratio: f64 },

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Primitive error: {0}")]
    Primitive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Episode cancelled")]
    Cancelled,
}

impl serde::Serialize for HarnessError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
