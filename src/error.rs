use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A numeric parameter failed validation while constructing a component.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Historical data or symbol metadata could not be obtained.
    #[error("{what} unavailable for {symbol}")]
    ExternalUnavailable { symbol: String, what: String },

    #[error("invalid bar series for {symbol} at index {index}: {reason}")]
    InvalidSeries {
        symbol: String,
        index: usize,
        reason: String,
    },

    #[error("unknown strategy template: {0}")]
    UnknownStrategy(String),
}

impl EngineError {
    pub fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(symbol: &str, what: impl Into<String>) -> Self {
        EngineError::ExternalUnavailable {
            symbol: symbol.to_string(),
            what: what.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
