use crate::alert::AlertMode;
use crate::parse::Quote;
use crate::schema::{alert_config, assets, prices};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Smallest price movement that counts as a change.
pub const PRICE_EPSILON: f64 = 2e-7;
pub const DEFAULT_INTERVAL_MINUTES: f64 = 60.0;

/// Returns whether `new` differs enough from the last stored price to be persisted.
/// Without a stored price every observation is material.
pub fn is_material_change(previous: Option<f64>, new: f64) -> bool {
    match previous {
        Some(previous) => (new - previous).abs() >= PRICE_EPSILON,
        None => true,
    }
}

pub struct Store {
    conn: SqliteConnection,
}

#[derive(Debug, Clone, PartialEq, Queryable)]
pub struct PriceObservation {
    pub id: i32,
    pub asset_id: i32,
    pub unix_time: f64,
    pub timestamp: String,
    pub price: f64,
}

#[derive(Debug)]
pub struct AssetSummary {
    pub external_id: String,
    pub name: String,
    pub latest: Option<PriceObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertConfig {
    pub interval_minutes: f64,
    pub mode: AlertMode,
    pub mail_address: Option<String>,
    pub mail_password: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            mode: AlertMode::Local,
            mail_address: None,
            mail_password: None,
        }
    }
}

impl AlertConfig {
    pub fn interval(&self) -> Duration {
        let seconds = self.interval_minutes * 60.0;
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds.min(1e12))
        } else {
            Duration::from_secs(0)
        }
    }
}

#[derive(Queryable)]
struct AlertConfigRow {
    _key: i32,
    interval_minutes: f64,
    mode: String,
    mail_address: Option<String>,
    mail_password: Option<String>,
}

impl AlertConfigRow {
    fn into_config(self) -> Result<AlertConfig, StoreError> {
        Ok(AlertConfig {
            interval_minutes: self.interval_minutes,
            mode: self
                .mode
                .parse()
                .map_err(|_| StoreError::InvalidMode(self.mode.clone()))?,
            mail_address: self.mail_address,
            mail_password: self.mail_password,
        })
    }
}

#[derive(Insertable)]
#[table_name = "assets"]
struct NewAsset<'a> {
    external_id: &'a str,
    name: &'a str,
}

#[derive(Insertable)]
#[table_name = "prices"]
struct NewPrice<'a> {
    asset_id: i32,
    unix_time: f64,
    timestamp: &'a str,
    price: f64,
}

#[derive(Insertable)]
#[table_name = "alert_config"]
struct NewAlertConfig<'a> {
    interval_minutes: f64,
    mode: &'a str,
    mail_address: Option<&'a str>,
    mail_password: Option<&'a str>,
}

impl Store {
    /// Opens (creating if needed) the database and brings its schema up to date.
    pub fn open(path: &str) -> Result<Store, StoreError> {
        let conn = SqliteConnection::establish(path)?;
        crate::embedded_migrations::run(&conn)?;
        Ok(Store { conn })
    }

    pub fn add_asset(&self, external_id: &str, name: &str) -> Result<i32, StoreError> {
        self.conn.transaction::<_, StoreError, _>(|| {
            diesel::insert_into(assets::table)
                .values(&NewAsset { external_id, name })
                .execute(&self.conn)?;
            self.resolve(external_id)
        })
    }

    /// External identifiers of every tracked asset, in registration order.
    pub fn tracked_assets(&self) -> Result<Vec<String>, StoreError> {
        Ok(assets::table
            .order(assets::id.asc())
            .select(assets::external_id)
            .load::<String>(&self.conn)?)
    }

    pub fn resolve(&self, external_id: &str) -> Result<i32, StoreError> {
        let ids = assets::table
            .filter(assets::external_id.eq(external_id))
            .select(assets::id)
            .limit(2)
            .load::<i32>(&self.conn)?;
        single_mapping(external_id, &ids)
    }

    pub fn latest_price(&self, asset_id: i32) -> Result<Option<f64>, StoreError> {
        Ok(prices::table
            .filter(prices::asset_id.eq(asset_id))
            .order(prices::id.desc())
            .select(prices::price)
            .first::<f64>(&self.conn)
            .optional()?)
    }

    /// Persists every quote whose price moved since the asset's last observation and
    /// returns how many rows were written.
    ///
    /// All identifiers are resolved before anything is written, so a drifted
    /// configuration leaves the store untouched. After that each asset is handled in
    /// its own transaction: a failure aborts the batch but keeps earlier assets' rows.
    pub fn record(&self, quotes: &[Quote]) -> Result<usize, StoreError> {
        let resolved = quotes
            .iter()
            .map(|quote| self.resolve(&quote.external_id).map(|id| (id, quote)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut written = 0;
        for (asset_id, quote) in resolved {
            let inserted = self.conn.transaction::<_, StoreError, _>(|| {
                let previous = self.latest_price(asset_id)?;
                if !is_material_change(previous, quote.price) {
                    debug!("{} unchanged at {}", quote.external_id, quote.price);
                    return Ok(false);
                }

                diesel::insert_into(prices::table)
                    .values(&NewPrice {
                        asset_id,
                        unix_time: quote.unix_time,
                        timestamp: &quote.timestamp,
                        price: quote.price,
                    })
                    .execute(&self.conn)?;
                debug!("{}: {:?} -> {}", quote.external_id, previous, quote.price);
                Ok(true)
            })?;

            if inserted {
                written += 1;
            }
        }

        Ok(written)
    }

    pub fn history(&self, external_id: &str) -> Result<Vec<PriceObservation>, StoreError> {
        let asset_id = self.resolve(external_id)?;
        Ok(prices::table
            .filter(prices::asset_id.eq(asset_id))
            .order(prices::id.asc())
            .load::<PriceObservation>(&self.conn)?)
    }

    pub fn summaries(&self) -> Result<Vec<AssetSummary>, StoreError> {
        let tracked = assets::table
            .order(assets::name.asc())
            .select((assets::id, assets::external_id, assets::name))
            .load::<(i32, String, String)>(&self.conn)?;

        tracked
            .into_iter()
            .map(|(asset_id, external_id, name)| -> Result<AssetSummary, StoreError> {
                let latest = prices::table
                    .filter(prices::asset_id.eq(asset_id))
                    .order(prices::id.desc())
                    .first::<PriceObservation>(&self.conn)
                    .optional()?;
                Ok(AssetSummary {
                    external_id,
                    name,
                    latest,
                })
            })
            .collect()
    }

    /// The most recently written alert configuration, if any was written yet.
    pub fn alert_config(&self) -> Result<Option<AlertConfig>, StoreError> {
        alert_config::table
            .order(alert_config::key.desc())
            .first::<AlertConfigRow>(&self.conn)
            .optional()?
            .map(AlertConfigRow::into_config)
            .transpose()
    }

    pub fn set_alert_config(&self, config: &AlertConfig) -> Result<(), StoreError> {
        diesel::insert_into(alert_config::table)
            .values(&NewAlertConfig {
                interval_minutes: config.interval_minutes,
                mode: config.mode.as_str(),
                mail_address: config.mail_address.as_deref(),
                mail_password: config.mail_password.as_deref(),
            })
            .execute(&self.conn)?;
        Ok(())
    }
}

fn single_mapping(external_id: &str, ids: &[i32]) -> Result<i32, StoreError> {
    match ids {
        [id] => Ok(*id),
        [] => Err(StoreError::UnmappedAsset(external_id.to_string())),
        _ => Err(StoreError::DuplicateAsset(external_id.to_string())),
    }
}

#[derive(Debug)]
pub enum StoreError {
    ConnectionError(diesel::ConnectionError),
    MigrationError(diesel_migrations::RunMigrationsError),
    QueryError(diesel::result::Error),
    UnmappedAsset(String),
    DuplicateAsset(String),
    InvalidMode(String),
}

impl std::error::Error for StoreError {}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConnectionError(e) => write!(
                f,
                "Error opening database, probably the database is missing: {}",
                e
            ),
            StoreError::MigrationError(e) => write!(f, "Error preparing the database schema: {}", e),
            StoreError::QueryError(e) => write!(f, "Error accessing the database: {}", e),
            StoreError::UnmappedAsset(id) => write!(
                f,
                "The crypto {} was requested but has no internal ID in the database",
                id
            ),
            StoreError::DuplicateAsset(id) => write!(
                f,
                "Duplicated ID entries for the same crypto currency: {}, the database in your computer is not reliable. Aborting.",
                id
            ),
            StoreError::InvalidMode(mode) => write!(f, "Unknown alert mode '{}' in the configuration", mode),
        }
    }
}

impl From<diesel::ConnectionError> for StoreError {
    fn from(e: diesel::ConnectionError) -> Self {
        StoreError::ConnectionError(e)
    }
}

impl From<diesel_migrations::RunMigrationsError> for StoreError {
    fn from(e: diesel_migrations::RunMigrationsError) -> Self {
        StoreError::MigrationError(e)
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::QueryError(e)
    }
}
