#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

use std::fmt::{Display, Formatter};

pub mod alert;
pub mod config;
pub mod fetch;
pub mod mail;
pub mod parse;
pub mod process;
pub mod scheduler;
mod schema;
pub mod store;

pub use alert::{AlertMode, DispatchError, Dispatcher};
pub use config::{ConfigError, Settings};
pub use fetch::{CoinGeckoClient, FetchError, PriceSource};
pub use mail::{MailError, Mailer, SmtpMailer};
pub use parse::ParseError;
pub use process::{watch_frontend, ProcessCommand, ProcessHandle, Shutdown};
pub use scheduler::{Scheduler, Tick};
pub use store::{AlertConfig, Store, StoreError};

embed_migrations!();

#[derive(Debug)]
pub enum Error {
    NoAssets,
    FetchError(FetchError),
    ParseError(ParseError),
    StoreError(StoreError),
    DispatchError(DispatchError),
    ConfigError(ConfigError),
    ProcessError(std::io::Error),
    FrontendError(std::io::Error),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoAssets => write!(f, "You haven't defined any cryptos to query"),
            Error::FetchError(e) => Display::fmt(e, f),
            Error::ParseError(e) => Display::fmt(e, f),
            Error::StoreError(e) => Display::fmt(e, f),
            Error::DispatchError(e) => Display::fmt(e, f),
            Error::ConfigError(e) => Display::fmt(e, f),
            Error::ProcessError(e) => write!(f, "Error: Failed to run the analysis process: {}", e),
            Error::FrontendError(e) => write!(f, "Error: Failed to start the front-end: {}", e),
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        Error::FetchError(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::ParseError(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::StoreError(e)
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Error::DispatchError(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::ConfigError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ProcessError(e)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::PathBuf;

    /// A fresh path under the temp dir, unique per test process and name.
    pub fn temp_path(name: &str, extension: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "coinwatch-{}-{}.{}",
            std::process::id(),
            name,
            extension
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    pub fn temp_db(name: &str) -> String {
        temp_path(name, "db").to_string_lossy().into_owned()
    }
}
