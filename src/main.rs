// src/main.rs
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};
use std::sync::Arc;
use stock_trader::api;
use stock_trader::auth::Accounts;
use stock_trader::broker::Broker;
use stock_trader::config::{Config, OracleProvider};
use stock_trader::db::Ledger;
use stock_trader::oracle::{AlphaVantageOracle, FixedPriceOracle, PriceOracle};
use stock_trader::session::SessionStore;
use tokio::task;
use tokio::time::{self, Duration};
use uuid::Uuid;

async fn session_sweeper(sessions: Arc<SessionStore>) {
    let mut ticker = time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let purged = sessions.purge_expired().await;
        if purged > 0 {
            debug!(
                "Purged {} expired sessions, {} active",
                purged,
                sessions.active().await
            );
        }
    }
}

fn build_oracle(config: &Config) -> Result<Arc<dyn PriceOracle>, String> {
    let oracle = &config.oracle;
    match oracle.provider {
        OracleProvider::AlphaVantage => {
            let client = AlphaVantageOracle::new(
                &oracle.base_url,
                &oracle.api_key,
                Duration::from_millis(oracle.timeout_ms),
            )
            .map_err(|e| e.to_string())?;
            info!("Using AlphaVantage prices from {}", oracle.base_url);
            Ok(Arc::new(client))
        }
        OracleProvider::Fixed => {
            let fixed = FixedPriceOracle::new();
            for (symbol, price) in &oracle.fixed_prices {
                fixed.set_price(symbol, symbol, *price);
            }
            info!("Using {} fixed prices", oracle.fixed_prices.len());
            Ok(Arc::new(fixed))
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::load();
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| LevelFilter::Info.to_string());
    Builder::new()
        .parse_filters(&level)
        .format_timestamp_secs()
        .init();
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return;
        }
    };

    let ledger = match Ledger::init(&config.database_path).await {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };

    let oracle = match build_oracle(&config) {
        Ok(oracle) => oracle,
        Err(e) => {
            error!("Failed to initialize price oracle: {}", e);
            return;
        }
    };

    let secret = match &config.session.secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("No session secret configured; sessions will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        }
    };
    let sessions = Arc::new(SessionStore::new(&secret, config.session.ttl_secs));

    let broker = Arc::new(Broker::new(
        ledger.clone(),
        oracle,
        Duration::from_millis(config.oracle.timeout_ms),
    ));
    let accounts = Arc::new(Accounts::new(
        ledger,
        sessions.clone(),
        config.starting_cash,
        config.bcrypt_cost,
    ));

    task::spawn(session_sweeper(sessions.clone()));

    let routes = api::routes(broker, accounts, sessions);

    info!("Starting the stock trader application...");
    let (addr, server) = match warp::serve(routes).try_bind_with_graceful_shutdown(
        config.listen,
        async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
        },
    ) {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen, e);
            return;
        }
    };
    info!("Server running on http://{}", addr);
    server.await;
}
