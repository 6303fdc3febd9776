use crate::mail::{mail_server, MailAccount, MailError, Mailer};
use crate::parse::now_local;
use crate::store::{Store, StoreError};
use log::{error, info};
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Analysis output line carrying nothing actionable.
pub const PLACEHOLDER: &str = ".";
/// Analysis notice that is always kept in the log, whatever the mode.
pub const WAITING_FOR_DATA: &str = "The Database was updated but is still waiting for data";
const SEPARATOR_WIDTH: usize = 156;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMode {
    Local,
    Mail,
    Error,
    Kill,
}

impl AlertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMode::Local => "local",
            AlertMode::Mail => "mail",
            AlertMode::Error => "error",
            AlertMode::Kill => "kill",
        }
    }
}

impl FromStr for AlertMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(AlertMode::Local),
            "mail" => Ok(AlertMode::Mail),
            "error" => Ok(AlertMode::Error),
            "kill" => Ok(AlertMode::Kill),
            other => Err(other.to_string()),
        }
    }
}

impl Display for AlertMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_placeholder(message: &str) -> bool {
    let message = message.trim_end_matches(|c: char| c == '\n' || c == '\r');
    message.is_empty() || message == PLACEHOLDER
}

/// Routes alert messages to the log file or to the configured mailbox.
pub struct Dispatcher<M> {
    log_path: PathBuf,
    db_path: String,
    mailer: M,
}

impl<M: Mailer> Dispatcher<M> {
    pub fn new<P: AsRef<Path>>(log_path: P, db_path: &str, mailer: M) -> Self {
        Dispatcher {
            log_path: log_path.as_ref().to_path_buf(),
            db_path: db_path.to_string(),
            mailer,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn mailer(&self) -> &M {
        &self.mailer
    }

    pub fn dispatch(&self, messages: &[String], mode: AlertMode) -> Result<(), DispatchError> {
        let messages = messages
            .iter()
            .map(String::as_str)
            .filter(|message| !is_placeholder(message))
            .collect::<Vec<_>>();

        if messages.is_empty() && mode != AlertMode::Kill {
            return Ok(());
        }

        let mut log = self.open_log()?;
        match mode {
            AlertMode::Local => write_lines(&mut log, &messages),
            AlertMode::Error => self.write_errors(&mut log, &messages),
            AlertMode::Kill => {
                writeln!(log, "{}", "-".repeat(SEPARATOR_WIDTH)).map_err(DispatchError::LogWrite)
            }
            AlertMode::Mail => {
                for outcome in self.mail_all(&messages) {
                    match outcome {
                        Ok(line) => write_lines(&mut log, &[line.as_str()])?,
                        Err(e) => {
                            let line = format!("Couldn't send mail alert: {}", e);
                            self.write_errors(&mut log, &[line.as_str()])?
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn write_errors(&self, log: &mut File, messages: &[&str]) -> Result<(), DispatchError> {
        println!("An error was encountered, see {}", self.log_path.display());
        for message in messages {
            error!("{}", message.trim_end());
        }
        write_lines(log, messages)
    }

    /// Mails every message on its own and returns, per message, the line to log or
    /// the reason delivery failed.
    fn mail_all(&self, messages: &[&str]) -> Vec<Result<String, DispatchError>> {
        let needs_account = messages
            .iter()
            .any(|message| !message.contains(WAITING_FOR_DATA));
        let account = if needs_account {
            Some(self.mail_account())
        } else {
            None
        };

        messages
            .iter()
            .map(|message| {
                if message.contains(WAITING_FOR_DATA) {
                    return Ok(message.to_string());
                }

                match &account {
                    Some(Ok(account)) => {
                        self.deliver(account, message)?;
                        info!("mailed alert to {}", account.address);
                        Ok(format!("Mail alert sent to {}", account.address))
                    }
                    Some(Err(e)) => Err(DispatchError::MailError(e.to_string())),
                    None => Err(DispatchError::MissingCredentials),
                }
            })
            .collect()
    }

    fn mail_account(&self) -> Result<MailAccount, DispatchError> {
        let config = Store::open(&self.db_path)?
            .alert_config()?
            .ok_or(DispatchError::MissingCredentials)?;
        MailAccount::from_config(&config).ok_or(DispatchError::MissingCredentials)
    }

    fn deliver(&self, account: &MailAccount, message: &str) -> Result<(), DispatchError> {
        let domain = account
            .domain()
            .ok_or_else(|| DispatchError::InvalidAddress(account.address.clone()))?;
        let server = mail_server(domain)
            .ok_or_else(|| DispatchError::UnsupportedDomain(domain.to_string()))?;

        self.mailer
            .send(&server, account, message.trim_end())
            .map_err(DispatchError::from)
    }

    fn open_log(&self) -> Result<File, DispatchError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| {
                println!(
                    "[{}] Error opening {}. Couldn't write an alert",
                    now_local(),
                    self.log_path.display()
                );
                DispatchError::LogUnavailable(e.to_string())
            })
    }
}

/// Messages already ending in a line break are written as they are.
fn write_lines(log: &mut File, messages: &[&str]) -> Result<(), DispatchError> {
    let timestamp = now_local();
    for message in messages {
        write!(log, "[{}] {}", timestamp, message).map_err(DispatchError::LogWrite)?;
        if !message.ends_with('\n') {
            writeln!(log).map_err(DispatchError::LogWrite)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum DispatchError {
    LogUnavailable(String),
    LogWrite(std::io::Error),
    MissingCredentials,
    InvalidAddress(String),
    UnsupportedDomain(String),
    ConfigError(String),
    MailError(String),
}

impl std::error::Error for DispatchError {}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::LogUnavailable(e) => write!(f, "alert log can't be opened: {}", e),
            DispatchError::LogWrite(e) => write!(f, "alert log can't be written: {}", e),
            DispatchError::MissingCredentials => {
                write!(f, "missing mail credentials, set a mail address and password first")
            }
            DispatchError::InvalidAddress(address) => write!(f, "'{}' is not a mail address", address),
            DispatchError::UnsupportedDomain(domain) => {
                write!(f, "mail provider {} is not supported", domain)
            }
            DispatchError::ConfigError(e) => write!(f, "couldn't read mail settings: {}", e),
            DispatchError::MailError(e) => write!(f, "{}", e),
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        DispatchError::ConfigError(e.to_string())
    }
}

impl From<MailError> for DispatchError {
    fn from(e: MailError) -> Self {
        DispatchError::MailError(e.to_string())
    }
}
