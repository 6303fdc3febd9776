use crate::alert::{AlertMode, Dispatcher, PLACEHOLDER};
use crate::fetch::PriceSource;
use crate::mail::Mailer;
use crate::parse::{check_liveness, parse_prices};
use crate::process::{capture_output, ProcessCommand, Shutdown};
use crate::store::{AlertConfig, Store};
use crate::Error;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

pub const ENOUGH_DATA: &str =
    "There is now enough data for at least 1 currency to perform analyses from now on";

/// What a single tick of the poll loop ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Unchanged,
    Changed(usize),
    Failed,
}

pub struct Scheduler<S, M> {
    db_path: String,
    currency: String,
    analysis: ProcessCommand,
    source: S,
    dispatcher: Dispatcher<M>,
    config: AlertConfig,
    last_poll: Option<Instant>,
    data_announced: bool,
}

impl<S: PriceSource, M: Mailer> Scheduler<S, M> {
    pub fn new(
        db_path: &str,
        currency: &str,
        analysis: ProcessCommand,
        source: S,
        dispatcher: Dispatcher<M>,
    ) -> Self {
        Scheduler {
            db_path: db_path.to_string(),
            currency: currency.to_string(),
            analysis,
            source,
            dispatcher,
            config: AlertConfig::default(),
            last_poll: None,
            data_announced: false,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<M> {
        &self.dispatcher
    }

    /// Ticks every `cadence` until `shutdown` is triggered, then closes the log section.
    pub fn run(&mut self, shutdown: &Shutdown, cadence: Duration) {
        info!("watching prices, checking every {:?}", cadence);
        while !shutdown.is_triggered() {
            self.tick(Instant::now(), shutdown);
            if shutdown.wait_timeout(cadence) {
                break;
            }
        }

        info!("shutting down");
        self.alert(&[], AlertMode::Kill);
    }

    pub fn tick(&mut self, now: Instant, shutdown: &Shutdown) -> Tick {
        match Store::open(&self.db_path).and_then(|store| store.alert_config()) {
            Ok(Some(config)) => self.config = config,
            Ok(None) => {}
            Err(e) => self.alert(&[e.to_string()], AlertMode::Error),
        }

        let due = self.last_poll.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.interval()
        });
        if !due {
            return Tick::Idle;
        }
        self.last_poll = Some(now);

        let written = match self.poll() {
            Ok(written) => written,
            Err(e @ Error::NoAssets) => {
                self.alert(&[e.to_string()], AlertMode::Local);
                return Tick::Failed;
            }
            Err(e) => {
                error!("poll failed: {}", e);
                self.alert(&[e.to_string()], AlertMode::Error);
                return Tick::Failed;
            }
        };

        if written == 0 {
            debug!("no price changed");
            return Tick::Unchanged;
        }

        match capture_output(&self.analysis, shutdown) {
            Ok(_) if shutdown.is_triggered() => debug!("discarding analysis output after shutdown"),
            Ok(output) => self.forward_analysis(&output),
            Err(e) => self.alert(&[Error::from(e).to_string()], AlertMode::Error),
        }

        Tick::Changed(written)
    }

    /// One fetch, parse and persist cycle. Returns how many prices were written.
    pub fn poll(&self) -> Result<usize, Error> {
        let tracked = Store::open(&self.db_path)?.tracked_assets()?;
        if tracked.is_empty() {
            return Err(Error::NoAssets);
        }

        let responses = self.source.fetch(&tracked)?;
        check_liveness(&responses.ping, &responses.prices)?;
        let quotes = parse_prices(&responses.prices, &tracked, &self.currency)?;
        if quotes.len() < tracked.len() {
            warn!(
                "price API returned {} of {} requested cryptos",
                quotes.len(),
                tracked.len()
            );
        }

        let written = Store::open(&self.db_path)?.record(&quotes)?;
        info!("{} of {} prices changed", written, quotes.len());
        Ok(written)
    }

    fn forward_analysis(&mut self, output: &[String]) {
        let first_data = output
            .first()
            .map_or(false, |line| line.trim_end() == PLACEHOLDER);
        if first_data && !self.data_announced {
            self.alert(&[ENOUGH_DATA.to_string()], AlertMode::Local);
            self.data_announced = true;
        }

        self.alert(output, self.config.mode);
    }

    fn alert(&self, messages: &[String], mode: AlertMode) {
        if let Err(e) = self.dispatcher.dispatch(messages, mode) {
            error!("couldn't dispatch {} alert: {}", mode, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, RawResponses};
    use crate::mail::{MailAccount, MailError, MailServer};
    use crate::test_util::{temp_db, temp_path};
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::thread;

    const PING_OK: &str = r#"{"gecko_says":"(V3) To the Moon!"}"#;

    struct StubSource {
        prices: RefCell<String>,
        ping: RefCell<String>,
        down: Cell<bool>,
        calls: Cell<usize>,
    }

    impl StubSource {
        fn new() -> Self {
            StubSource {
                prices: RefCell::new("{}".to_string()),
                ping: RefCell::new(PING_OK.to_string()),
                down: Cell::new(false),
                calls: Cell::new(0),
            }
        }

        fn set_prices(&self, body: &str) {
            *self.prices.borrow_mut() = body.to_string();
        }
    }

    impl PriceSource for StubSource {
        fn fetch(&self, _external_ids: &[String]) -> Result<RawResponses, FetchError> {
            self.calls.set(self.calls.get() + 1);
            if self.down.get() {
                return Err(FetchError::StatusError {
                    status: 503,
                    body: "Service Unavailable".to_string(),
                });
            }
            Ok(RawResponses {
                prices: self.prices.borrow().clone(),
                ping: self.ping.borrow().clone(),
            })
        }
    }

    struct OfflineMailer;

    impl Mailer for OfflineMailer {
        fn send(&self, _: &MailServer, _: &MailAccount, _: &str) -> Result<(), MailError> {
            Err(MailError::Transport("offline".to_string()))
        }
    }

    fn scheduler(name: &str, analysis: ProcessCommand) -> Scheduler<StubSource, OfflineMailer> {
        let db = temp_db(name);
        let dispatcher = Dispatcher::new(temp_path(name, "log"), &db, OfflineMailer);
        Scheduler::new(&db, "usd", analysis, StubSource::new(), dispatcher)
    }

    fn track(scheduler: &Scheduler<StubSource, OfflineMailer>, ids: &[&str]) -> Store {
        let store = Store::open(&scheduler.db_path).unwrap();
        for id in ids {
            store.add_asset(id, id).unwrap();
        }
        store
    }

    fn log(scheduler: &Scheduler<StubSource, OfflineMailer>) -> String {
        fs::read_to_string(scheduler.dispatcher().log_path()).unwrap_or_default()
    }

    fn price_body(price: f64) -> String {
        format!(r#"{{"bitcoin":{{"usd":{},"last_updated_at":1738184426}}}}"#, price)
    }

    fn no_analysis() -> ProcessCommand {
        ProcessCommand::new("coinwatch-no-such-analysis", &[])
    }

    #[test]
    fn first_tick_polls_and_interval_gates_the_rest() {
        let mut scheduler = scheduler("sched-interval", no_analysis());
        let store = track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));
        let shutdown = Shutdown::new();
        let start = Instant::now();

        assert_eq!(scheduler.tick(start, &shutdown), Tick::Changed(1));
        assert_eq!(scheduler.tick(start + Duration::from_secs(5), &shutdown), Tick::Idle);
        assert_eq!(scheduler.source.calls.get(), 1);

        let later = start + Duration::from_secs(61 * 60);
        assert_eq!(scheduler.tick(later, &shutdown), Tick::Unchanged);
        assert_eq!(store.history("bitcoin").unwrap().len(), 1);
    }

    #[test]
    fn configured_interval_is_read_every_tick() {
        let mut scheduler = scheduler("sched-config", no_analysis());
        let store = track(&scheduler, &["bitcoin"]);
        store
            .set_alert_config(&AlertConfig {
                interval_minutes: 0.5,
                ..AlertConfig::default()
            })
            .unwrap();
        scheduler.source.set_prices(&price_body(100.0));
        let shutdown = Shutdown::new();
        let start = Instant::now();

        scheduler.tick(start, &shutdown);
        assert_eq!(scheduler.tick(start + Duration::from_secs(20), &shutdown), Tick::Idle);
        assert_eq!(scheduler.tick(start + Duration::from_secs(30), &shutdown), Tick::Unchanged);
    }

    #[test]
    fn rate_limit_is_alerted_without_writes() {
        let mut scheduler = scheduler("sched-rate-limit", no_analysis());
        let store = track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));
        *scheduler.source.ping.borrow_mut() =
            r#"{"status":{"error_code":429,"error_message":"You've exceeded the Rate Limit."}}"#
                .to_string();

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Failed);
        assert!(log(&scheduler).contains("] Rate limited, server response:"));
        assert!(store.history("bitcoin").unwrap().is_empty());
    }

    #[test]
    fn unexpected_ping_is_alerted() {
        let mut scheduler = scheduler("sched-down", no_analysis());
        track(&scheduler, &["bitcoin"]);
        *scheduler.source.ping.borrow_mut() = "<html>maintenance</html>".to_string();

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Failed);
        assert!(log(&scheduler).contains("API may be down, response: <html>maintenance</html>"));
    }

    #[test]
    fn error_status_instead_of_prices_is_alerted() {
        let mut scheduler = scheduler("sched-error-status", no_analysis());
        let store = track(&scheduler, &["bitcoin"]);
        scheduler
            .source
            .set_prices(r#"{"status":{"error_code":401,"error_message":"Missing API key"}}"#);

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Failed);
        assert!(log(&scheduler).contains("API may be down, response:"));
        assert!(log(&scheduler).contains("Missing API key"));
        assert!(store.history("bitcoin").unwrap().is_empty());
    }

    #[test]
    fn outage_does_not_stop_the_loop() {
        let mut scheduler = scheduler("sched-outage", no_analysis());
        track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));
        scheduler.source.down.set(true);
        let shutdown = Shutdown::new();
        let start = Instant::now();

        assert_eq!(scheduler.tick(start, &shutdown), Tick::Failed);
        assert!(log(&scheduler).contains("status 503"));

        scheduler.source.down.set(false);
        let later = start + Duration::from_secs(60 * 60);
        assert_eq!(scheduler.tick(later, &shutdown), Tick::Changed(1));
    }

    #[test]
    fn empty_watch_list_is_reported_locally() {
        let mut scheduler = scheduler("sched-empty", no_analysis());

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Failed);
        assert_eq!(scheduler.source.calls.get(), 0);
        assert!(log(&scheduler).contains("You haven't defined any cryptos to query"));
    }

    #[test]
    fn partial_response_only_counts_returned_assets() {
        let mut scheduler = scheduler("sched-partial", no_analysis());
        let store = track(&scheduler, &["bitcoin", "ethereum", "dogecoin"]);
        scheduler.source.set_prices(&price_body(100.0));

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Changed(1));
        assert!(store.history("ethereum").unwrap().is_empty());
    }

    #[test]
    fn failed_analysis_start_is_alerted() {
        let mut scheduler = scheduler("sched-no-analysis", no_analysis());
        track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Changed(1));
        assert!(log(&scheduler).contains("Failed to run the analysis process"));
    }

    #[cfg(unix)]
    #[test]
    fn analysis_output_is_forwarded_and_first_data_announced_once() {
        let analysis = ProcessCommand::new("sh", &["-c", "printf '.\\nbitcoin jumped\\n'"]);
        let mut scheduler = scheduler("sched-analysis", analysis);
        track(&scheduler, &["bitcoin"]);
        let shutdown = Shutdown::new();
        let start = Instant::now();

        scheduler.source.set_prices(&price_body(100.0));
        assert_eq!(scheduler.tick(start, &shutdown), Tick::Changed(1));
        scheduler.source.set_prices(&price_body(101.0));
        let later = start + Duration::from_secs(60 * 60);
        assert_eq!(scheduler.tick(later, &shutdown), Tick::Changed(1));

        let log = log(&scheduler);
        assert_eq!(log.matches(ENOUGH_DATA).count(), 1);
        assert_eq!(log.matches("] bitcoin jumped").count(), 2);
        assert!(!log.contains("] .\n"));
    }

    #[cfg(unix)]
    #[test]
    fn silently_failing_analysis_is_alerted() {
        let analysis = ProcessCommand::new("sh", &["-c", "exit 1"]);
        let mut scheduler = scheduler("sched-silent-analysis", analysis);
        track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));

        assert_eq!(scheduler.tick(Instant::now(), &Shutdown::new()), Tick::Changed(1));
        assert!(log(&scheduler).contains("printed nothing"));
    }

    #[cfg(unix)]
    #[test]
    fn waiting_output_is_not_announced() {
        let analysis = ProcessCommand::new(
            "sh",
            &["-c", "echo 'The Database was updated but is still waiting for data'"],
        );
        let mut scheduler = scheduler("sched-waiting", analysis);
        track(&scheduler, &["bitcoin"]);
        scheduler.source.set_prices(&price_body(100.0));

        scheduler.tick(Instant::now(), &Shutdown::new());

        let log = log(&scheduler);
        assert!(!log.contains(ENOUGH_DATA));
        assert!(log.contains("still waiting for data"));
    }

    #[test]
    fn shutdown_writes_separator_and_exits() {
        let mut scheduler = scheduler("sched-shutdown", no_analysis());
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.trigger();
        });

        scheduler.run(&shutdown, Duration::from_millis(10));
        trigger.join().unwrap();

        let log = log(&scheduler);
        assert!(log.trim_end().ends_with(&"-".repeat(156)));
        assert_eq!(log.matches("You haven't defined any cryptos").count(), 1);
    }
}
