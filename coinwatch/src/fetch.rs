use itertools::Itertools;
use log::debug;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Raw bodies of one poll: the batched price request and the ping that follows it.
#[derive(Debug, Clone)]
pub struct RawResponses {
    pub prices: String,
    pub ping: String,
}

#[derive(Debug)]
pub enum FetchError {
    HttpError(reqwest::Error),
    StatusError { status: u16, body: String },
}

impl std::error::Error for FetchError {}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::HttpError(e) => write!(
                f,
                "Failed to reach the price API, your internet is probably down: {}",
                e
            ),
            FetchError::StatusError { status, body } => {
                write!(f, "Price API answered with status {}: {}", status, body)
            }
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::HttpError(e)
    }
}

pub trait PriceSource {
    fn fetch(&self, external_ids: &[String]) -> Result<RawResponses, FetchError>;
}

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    currency: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: &str, currency: &str, timeout: Duration) -> Result<Self, FetchError> {
        Ok(CoinGeckoClient {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            currency: currency.to_string(),
        })
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("GET {} {:?}", url, query);

        let response = self.client.get(&url).query(query).send()?;
        let status = response.status();
        accept_status(status, response.text()?)
    }
}

/// Any unsuccessful status is an error, except a throttled 429 whose body goes to the
/// parser so it is reported as rate limiting.
fn accept_status(status: StatusCode, body: String) -> Result<String, FetchError> {
    if status.is_success() || status == StatusCode::TOO_MANY_REQUESTS {
        Ok(body)
    } else {
        Err(FetchError::StatusError {
            status: status.as_u16(),
            body,
        })
    }
}

impl PriceSource for CoinGeckoClient {
    fn fetch(&self, external_ids: &[String]) -> Result<RawResponses, FetchError> {
        let ids = external_ids.iter().join(",");
        let prices = self.get(
            "/simple/price",
            &[
                ("ids", ids.as_str()),
                ("vs_currencies", self.currency.as_str()),
                ("include_last_updated_at", "true"),
            ],
        )?;
        let ping = self.get("/ping", &[])?;

        Ok(RawResponses { prices, ping })
    }
}
