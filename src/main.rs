//! Pitwall - Reconciled Live Race Timing
//! Mission: One canonical view of the race, whichever provider saw it first
//!
//! Wires the core together: token manager with proactive refresh, the live
//! hub channel with reconnect/resubscribe, the rmonitor polling fallback,
//! and the reconciliation engine as single owner of canonical state.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use pitwall_backend::{
    auth::{HttpTokenExchange, TokenManager},
    live::{ConnectionManager, HubTransport, LiveEvent, Subscription},
    models::Config,
    providers::{RmonitorRestClient, TracksideRestClient},
    reconcile::ReconciliationEngine,
    store::RecordStore,
};

#[derive(Debug, Parser)]
#[command(name = "pitwall", about = "Reconciled live race timing backend")]
struct Args {
    /// Trackside event to follow
    #[arg(long, env = "PITWALL_EVENT_ID")]
    event_id: String,

    /// Trackside session within the event
    #[arg(long, env = "PITWALL_SESSION_ID")]
    session_id: String,

    /// RMonitor race id for the same session (enables the fallback poller)
    #[arg(long, env = "PITWALL_RACE_ID")]
    race_id: Option<i64>,

    /// SQLite database path (overrides PITWALL_DB_PATH)
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pitwall=info,pitwall_backend=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(db) = args.db {
        config.database_path = db;
    }

    info!("opening record store at {}", config.database_path);
    let store = RecordStore::open(&config.database_path).context("failed to open record store")?;

    // Credential session. The live channel and trackside REST both draw
    // from this one manager; refreshes are single-flight.
    let tokens = TokenManager::new(Arc::new(HttpTokenExchange::new(
        config.identity_token_url.clone(),
    )));
    match (config.client_id.clone(), config.client_secret.clone()) {
        (Some(id), Some(secret)) => tokens.configure(id, secret),
        _ => warn!("no trackside credentials configured; authenticated calls will fail"),
    }
    let refresh_task = tokens.spawn_refresh_loop();

    let trackside = TracksideRestClient::new(config.trackside_base_url.clone(), Arc::clone(&tokens))
        .context("failed to build trackside client")?;

    let engine = Arc::new(ReconciliationEngine::new(store.clone()));

    // Live channel: connect, subscribe, then let the manager own
    // reconnect/resubscribe for the rest of the session.
    let transport = Arc::new(HubTransport::new(config.trackside_hub_url.clone()));
    let (manager, mut state_rx, mut events) = ConnectionManager::new(transport);
    manager.connect().await.context("initial hub connect failed")?;
    manager
        .subscribe(Subscription::event(args.event_id.clone()))
        .await
        .context("event subscription failed")?;

    let run_task = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            if let Err(e) = manager.run().await {
                error!("live channel stopped: {}", e);
            }
        }
    });

    let state_task = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            info!("live channel is now {:?}", *state_rx.borrow());
        }
    });

    // Consume typed live events into the canonical view.
    let ingest_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            while let Some(event) = events.recv().await {
                match event {
                    LiveEvent::CarPositionBatch(cars) => {
                        for car in cars {
                            let Some(record) = car.as_object() else { continue };
                            if let Err(e) = engine.ingest_trackside(record) {
                                warn!("failed to ingest car record: {}", e);
                            }
                        }
                    }
                    LiveEvent::FullSession(session) => {
                        let cars = session.get("cars").and_then(|c| c.as_array());
                        for car in cars.into_iter().flatten() {
                            let Some(record) = car.as_object() else { continue };
                            if let Err(e) = engine.ingest_trackside(record) {
                                warn!("failed to ingest session car: {}", e);
                            }
                        }
                    }
                    LiveEvent::PatchSet(patch) => debug!("patch set: {}", patch),
                    LiveEvent::ControlLogBatch(lines) => {
                        for line in lines {
                            info!("race control: {}", line);
                        }
                    }
                    LiveEvent::InCar(payload) => debug!("in-car payload: {}", payload),
                }
            }
        }
    });

    // Polling fallback: rmonitor REST inside its free-tier budget. The
    // engine's commutative merge makes the race between this and the live
    // channel harmless.
    let poll_task = match (args.race_id, config.rmonitor_api_token.clone()) {
        (Some(race_id), Some(token)) => {
            let client = RmonitorRestClient::new(config.rmonitor_base_url.clone(), token)
                .context("failed to build rmonitor client")?;
            let engine = Arc::clone(&engine);
            let poll_secs = config.rmonitor_poll_interval_secs;
            Some(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(poll_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut ticks: u64 = 0;
                loop {
                    ticker.tick().await;
                    ticks += 1;
                    match client.get_race(race_id).await {
                        Ok((race, competitors)) => {
                            debug!("rmonitor poll: {} competitors in {}", competitors.len(), race.name);
                            for comp in &competitors {
                                if let Err(e) = engine.ingest_rmonitor(comp, None) {
                                    warn!("failed to ingest rmonitor competitor: {}", e);
                                }
                            }
                        }
                        Err(e) if matches!(e, pitwall_backend::errors::PitwallError::RateLimit(_)) => {
                            warn!("rmonitor throttled us; skipping this cycle: {}", e);
                            continue;
                        }
                        Err(e) => warn!("rmonitor poll failed: {}", e),
                    }
                    // lap chart is heavier; fetch it every fourth cycle
                    if ticks % 4 == 0 {
                        match client.get_lap_histories(race_id).await {
                            Ok(histories) => {
                                for (number, laps) in histories {
                                    let comp = pitwall_backend::providers::RmCompetitor {
                                        number,
                                        ..Default::default()
                                    };
                                    if let Err(e) = engine.ingest_rmonitor(&comp, Some(laps)) {
                                        warn!("failed to ingest lap history: {}", e);
                                    }
                                }
                            }
                            Err(e) => warn!("lap chart fetch failed: {}", e),
                        }
                    }
                }
            }))
        }
        _ => {
            info!("rmonitor fallback disabled (no race id or API token)");
            None
        }
    };

    // Seed the canonical view from REST in case the hub is quiet.
    match trackside.get_live_snapshot(&args.session_id).await {
        Ok(cars) => {
            info!("seeded {} cars from trackside snapshot", cars.len());
            for record in &cars {
                if let Err(e) = engine.ingest_trackside(record) {
                    warn!("failed to ingest seed record: {}", e);
                }
            }
        }
        Err(e) => warn!("initial snapshot fetch failed: {}", e),
    }

    info!("pitwall running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");

    // Teardown order matters: unsubscribe before closing the transport,
    // stop the pollers, persist what we learned.
    manager.shutdown().await;
    if let Some(task) = poll_task {
        task.abort();
    }
    refresh_task.abort();
    ingest_task.abort();
    state_task.abort();
    run_task.abort();

    let histories = engine.lap_histories();
    for (car_number, laps) in &histories {
        if laps.is_empty() {
            continue;
        }
        if let Err(e) = store.save_lap_history(&args.session_id, car_number, laps) {
            warn!("failed to persist laps for car {}: {}", car_number, e);
        }
    }
    info!("persisted lap histories for {} cars", histories.len());
    tokens.logout();

    Ok(())
}
