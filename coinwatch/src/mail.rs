use crate::store::AlertConfig;
use lazy_static::lazy_static;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use regex::Regex;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const SUBMISSION_PORT: u16 = 587;
pub const ALERT_SUBJECT: &str = "Crypto price alert";
const AUTH_REJECTED_CODE: &str = "535";

lazy_static! {
    static ref ADDRESS: Regex = Regex::new(r"^[^@\s]+@([^@\s]+\.[^@\s]+)$").unwrap();
}

/// Consumer mail domains and the hosts that actually accept submissions for them.
const MAIL_SERVERS: &[(&str, &str, Option<&str>)] = &[
    (
        "gmail.com",
        "smtp.gmail.com",
        Some("Gmail only accepts an app password here, not the account password"),
    ),
    ("outlook.com", "smtp-mail.outlook.com", None),
    ("hotmail.com", "smtp-mail.outlook.com", None),
    ("live.com", "smtp-mail.outlook.com", None),
    (
        "yahoo.com",
        "smtp.mail.yahoo.com",
        Some("Yahoo requires an app password generated in the account security settings"),
    ),
    (
        "icloud.com",
        "smtp.mail.me.com",
        Some("iCloud requires an app-specific password"),
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct MailServer {
    pub domain: String,
    pub host: &'static str,
    pub app_password_hint: Option<&'static str>,
}

pub fn mail_server(domain: &str) -> Option<MailServer> {
    let domain = domain.to_lowercase();
    MAIL_SERVERS
        .iter()
        .find(|(known, _, _)| *known == domain)
        .map(|&(_, host, app_password_hint)| MailServer {
            domain,
            host,
            app_password_hint,
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailAccount {
    pub address: String,
    pub password: String,
}

impl MailAccount {
    /// Empty or absent credentials yield `None`.
    pub fn from_config(config: &AlertConfig) -> Option<MailAccount> {
        let address = config.mail_address.as_deref().map(str::trim).unwrap_or("");
        let password = config.mail_password.as_deref().unwrap_or("");
        if address.is_empty() || password.is_empty() {
            return None;
        }

        Some(MailAccount {
            address: address.to_string(),
            password: password.to_string(),
        })
    }

    pub fn domain(&self) -> Option<&str> {
        ADDRESS
            .captures(&self.address)?
            .get(1)
            .map(|domain| domain.as_str())
    }
}

/// Delivers one alert body to the account's own mailbox.
pub trait Mailer {
    fn send(&self, server: &MailServer, account: &MailAccount, body: &str) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        SmtpMailer { timeout }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, server: &MailServer, account: &MailAccount, body: &str) -> Result<(), MailError> {
        let mailbox: Mailbox = account
            .address
            .parse()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", account.address, e)))?;

        let message = Message::builder()
            .from(mailbox.clone())
            .to(mailbox)
            .subject(ALERT_SUBJECT)
            .body(body.to_string())
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let transport = SmtpTransport::starttls_relay(server.host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(SUBMISSION_PORT)
            .credentials(Credentials::new(
                account.address.clone(),
                account.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| classify_smtp_error(server, e))
    }
}

fn classify_smtp_error(server: &MailServer, e: lettre::transport::smtp::Error) -> MailError {
    let rejected = e
        .status()
        .map_or(false, |code| code.to_string() == AUTH_REJECTED_CODE);

    if rejected {
        MailError::AuthenticationRejected {
            domain: server.domain.clone(),
            hint: server.app_password_hint,
            detail: e.to_string(),
        }
    } else {
        MailError::Transport(e.to_string())
    }
}

#[derive(Debug)]
pub enum MailError {
    InvalidAddress(String),
    AuthenticationRejected {
        domain: String,
        hint: Option<&'static str>,
        detail: String,
    },
    Transport(String),
}

impl std::error::Error for MailError {}

impl Display for MailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MailError::InvalidAddress(e) => write!(f, "invalid mail address {}", e),
            MailError::AuthenticationRejected {
                domain,
                hint: Some(hint),
                ..
            } => write!(f, "{} rejected the login. {}", domain, hint),
            MailError::AuthenticationRejected { domain, detail, .. } => {
                write!(f, "{} rejected the login: {}", domain, detail)
            }
            MailError::Transport(e) => write!(f, "mail transport failed: {}", e),
        }
    }
}
