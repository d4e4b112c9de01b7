// src/error.rs
use rust_decimal::Decimal;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid username and/or password")]
    InvalidCredentials,

    #[error("login required")]
    AuthRequired,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("too many shares of {symbol}: requested {requested}, held {held}")]
    InsufficientShares {
        symbol: String,
        requested: i64,
        held: i64,
    },

    #[error("symbol not owned: {0}")]
    NotOwned(String),

    #[error("price service unavailable: {0}")]
    OracleUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable name, used as the `error` field of an apology.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::InvalidCredentials => "auth",
            AppError::AuthRequired => "auth_required",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::InsufficientFunds { .. } => "insufficient_funds",
            AppError::InsufficientShares { .. } => "insufficient_shares",
            AppError::NotOwned(_) => "not_owned",
            AppError::OracleUnavailable(_) => "oracle_unavailable",
            AppError::Database(_) | AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InsufficientFunds { .. }
            | AppError::InsufficientShares { .. }
            | AppError::NotOwned(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::OracleUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Internal(_))
    }

    /// Text shown to the user. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "internal error, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}

impl Reject for AppError {}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn internal_errors_hide_details() {
        let err = AppError::Internal("disk on fire".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("disk"));
    }

    #[test]
    fn funds_error_reports_amounts() {
        let err = AppError::InsufficientFunds {
            needed: dec!(150.00),
            available: dec!(99.99),
        };
        assert_eq!(err.kind(), "insufficient_funds");
        assert_eq!(err.public_message(), "insufficient funds: need 150.00, have 99.99");
    }
}
