use crate::types::WeatherError;

/// Tri-state value published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UiState<T> {
    #[default]
    Loading,
    Success(T),
    Error(String),
}

impl<T> UiState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> UiState<U> {
        match self {
            Self::Loading => UiState::Loading,
            Self::Success(value) => UiState::Success(f(value)),
            Self::Error(message) => UiState::Error(message),
        }
    }
}

impl<T> From<Result<T, WeatherError>> for UiState<T> {
    fn from(result: Result<T, WeatherError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => Self::Error(e.user_message()),
        }
    }
}
