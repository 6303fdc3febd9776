#[macro_use]
extern crate prettytable;

use coinwatch::{
    watch_frontend, AlertConfig, AlertMode, CoinGeckoClient, Dispatcher, Scheduler, Settings,
    Shutdown, SmtpMailer, Store,
};
use log::error;
use std::process::exit;
use structopt::StructOpt;

/// The configuration front-end refuses intervals this short.
const MIN_INTERVAL_MINUTES: f64 = 0.09;

#[derive(StructOpt)]
#[structopt(name = "coinwatch", about = "track crypto prices and alert when they change")]
struct Options {
    #[structopt(subcommand)]
    command: Commands,
}

#[derive(StructOpt)]
enum Commands {
    #[structopt(name = "add", about = "start tracking a crypto by its CoinGecko ID")]
    Add { external_id: String, name: String },
    #[structopt(name = "configure", about = "change polling interval, alert mode or mail account")]
    Configure {
        #[structopt(short = "i", long = "interval", help = "minutes between price fetches")]
        interval: Option<f64>,
        #[structopt(short = "m", long = "mode", help = "local or mail")]
        mode: Option<AlertMode>,
        #[structopt(long = "mail-address")]
        mail_address: Option<String>,
        #[structopt(long = "mail-password")]
        mail_password: Option<String>,
    },
    #[structopt(name = "fetch", about = "run a single fetch and store changed prices")]
    Fetch,
    #[structopt(name = "list", about = "list tracked cryptos and their latest price")]
    List,
    #[structopt(name = "history", about = "show every stored price of one crypto")]
    History { external_id: String },
    #[structopt(name = "run", about = "poll prices until the front-end exits")]
    Run,
}

fn main() {
    dotenv::dotenv().ok();
    pretty_env_logger::init();

    let options = Options::from_args();
    let settings = Settings::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        exit(1);
    });

    if let Err(e) = execute(options.command, &settings) {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn execute(command: Commands, settings: &Settings) -> Result<(), coinwatch::Error> {
    match command {
        Commands::Add { external_id, name } => {
            let id = Store::open(&settings.db_path)?.add_asset(&external_id, &name)?;
            println!("Tracking {} ({}) as #{}", name, external_id, id);
        }
        Commands::Configure {
            interval,
            mode,
            mail_address,
            mail_password,
        } => {
            let store = Store::open(&settings.db_path)?;
            let mut config = store.alert_config()?.unwrap_or_default();

            if let Some(interval) = interval {
                if !(interval > MIN_INTERVAL_MINUTES) {
                    eprintln!("The interval must be longer than {} minutes", MIN_INTERVAL_MINUTES);
                    exit(2);
                }
                config.interval_minutes = interval;
            }
            if let Some(mode) = mode {
                if mode != AlertMode::Local && mode != AlertMode::Mail {
                    eprintln!("Only the local and mail modes can be configured");
                    exit(2);
                }
                config.mode = mode;
            }
            if mail_address.is_some() {
                config.mail_address = mail_address;
            }
            if mail_password.is_some() {
                config.mail_password = mail_password;
            }

            store.set_alert_config(&config)?;
            print_config(&config);
        }
        Commands::Fetch => {
            let written = scheduler(settings)?.poll()?;
            println!("{} prices changed", written);
        }
        Commands::List => {
            let mut table = prettytable::Table::new();
            table.set_titles(row!["Crypto", "ID", "Price", "Updated"]);
            for asset in Store::open(&settings.db_path)?.summaries()? {
                match asset.latest {
                    Some(latest) => table.add_row(row![
                        asset.name,
                        asset.external_id,
                        r -> format!("{:.6}", latest.price),
                        latest.timestamp
                    ]),
                    None => table.add_row(row![asset.name, asset.external_id, r -> "-", "never"]),
                };
            }
            table.set_format(*prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
            table.printstd();
        }
        Commands::History { external_id } => {
            for observation in Store::open(&settings.db_path)?.history(&external_id)? {
                println!("{}  {}", observation.timestamp, observation.price);
            }
        }
        Commands::Run => {
            let shutdown = Shutdown::new();
            let frontend = match &settings.frontend {
                Some(command) => Some(watch_frontend(command, &shutdown)?),
                None => None,
            };

            scheduler(settings)?.run(&shutdown, settings.tick);

            if let Some(frontend) = frontend {
                match frontend.join() {
                    Ok(Ok(status)) if !status.success() => error!("front-end exited with {}", status),
                    Ok(Err(e)) => error!("lost track of the front-end: {}", e),
                    Err(_) => error!("front-end watcher panicked"),
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

fn scheduler(
    settings: &Settings,
) -> Result<Scheduler<CoinGeckoClient, SmtpMailer>, coinwatch::Error> {
    let source = CoinGeckoClient::new(&settings.api_url, &settings.currency, settings.http_timeout)?;
    let dispatcher = Dispatcher::new(
        &settings.log_path,
        &settings.db_path,
        SmtpMailer::new(settings.http_timeout),
    );

    Ok(Scheduler::new(
        &settings.db_path,
        &settings.currency,
        settings.analysis.clone(),
        source,
        dispatcher,
    ))
}

fn print_config(config: &AlertConfig) {
    println!("interval: {} minutes", config.interval_minutes);
    println!("mode:     {}", config.mode);
    println!(
        "mail:     {}",
        config.mail_address.as_deref().unwrap_or("(not set)")
    );
}
