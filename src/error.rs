//! Error types for the subscription engine

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Subscription {subscription_id} is closed: {message}"))]
    SubscriptionClosed {
        message: String,
        subscription_id: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Engine is shut down"))]
    Shutdown { backtrace: Backtrace },
}

impl Error {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a subscription-closed error
    pub fn subscription_closed(
        subscription_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SubscriptionClosed {
            message: message.into(),
            subscription_id: subscription_id.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown() -> Self {
        Self::Shutdown {
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
