// Headless runner entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, stdout belongs to the console)
// 2. Parse arguments and load config
// 3. Build the API client and settle the session
// 4. Run the route guard for the requested screen
// 5. Run the mode: chat console, live-state watch, or settlement routing

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use mealmate_app::app::{self, ConsoleNavigator, Mode};
use mealmate_chat::{ChatSession, ChatSettings, TransportOptions};
use mealmate_core::api::ApiClient;
use mealmate_core::config::{self, Config};
use mealmate_core::guard::{self, RouteDecision};
use mealmate_core::poll::{self, PhaseIntervals, PollScheduler};
use mealmate_core::session::SessionStore;
use mealmate_core::settlement::{self, NavigationMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("mealmate starting up");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = app::parse_args(&args)?;

    let config = config::load_config().context("failed to load configuration")?;
    info!(api = %config.api.base_url, ws = %config.realtime.ws_url, "Config loaded");

    let api = ApiClient::new(&config.api, &config.credentials)
        .context("failed to build API client")?;
    let store = SessionStore::new(api.clone());
    store.refresh().await;

    let route = mode.route();
    match guard::decide_for(&route, &store.subscribe()) {
        RouteDecision::Allow => {}
        RouteDecision::Redirect(target) => {
            bail!("{route} is not available to this account (redirects to {target})")
        }
        RouteDecision::NotFound => bail!("{route} does not exist"),
        RouteDecision::Loading => bail!("session did not settle"),
    }

    match mode {
        Mode::Chat(meeting_id) => run_chat(&config, api, meeting_id).await?,
        Mode::Watch(meeting_id) => run_watch(&config, api, meeting_id).await,
        Mode::Settle(meeting_id) => run_settle(&api, meeting_id, None).await?,
        Mode::SettleWait(meeting_id) => {
            run_settle(&api, meeting_id, Some(config.polling.fixed_interval())).await?
        }
    }

    info!("mealmate shut down cleanly");
    Ok(())
}

async fn run_chat(config: &Config, api: ApiClient, meeting_id: u64) -> anyhow::Result<()> {
    let (transport_cmd_tx, transport_cmd_rx) = mpsc::channel(64);
    let (transport_event_tx, transport_event_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);

    let options = TransportOptions::from_config(&config.realtime, meeting_id, api.cookie_header());
    let transport_handle = tokio::spawn(mealmate_chat::transport::run(
        options,
        transport_cmd_rx,
        transport_event_tx,
    ));

    let (session, task_rx) = ChatSession::new(
        meeting_id,
        Arc::new(api),
        ChatSettings::from_config(&config.chat),
        transport_cmd_tx,
        ui_tx,
    );
    let chat_handle = tokio::spawn(mealmate_chat::run(
        transport_event_rx,
        cmd_rx,
        task_rx,
        session,
    ));

    let stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = app::run_console(stdin, tokio::io::stdout(), ui_rx, cmd_tx).await {
        error!("Console error: {e:#}");
    }

    // The session asks the transport to disconnect on its way out.
    let _ = tokio::time::timeout(Duration::from_secs(5), chat_handle).await;
    if tokio::time::timeout(Duration::from_secs(2), transport_handle)
        .await
        .is_err()
    {
        warn!("Transport did not stop in time");
    }
    Ok(())
}

async fn run_watch(config: &Config, api: ApiClient, meeting_id: u64) {
    // Headless: the document is always visible.
    let (visibility_tx, visibility_rx) = watch::channel(true);
    let (state_tx, mut state_rx) = mpsc::channel(16);
    let scheduler = PollScheduler::phased(PhaseIntervals::from_config(&config.polling));

    let poller = tokio::spawn(async move {
        poll::run_live_state_poller(&api, meeting_id, scheduler, visibility_rx, state_tx).await;
    });

    loop {
        tokio::select! {
            state = state_rx.recv() => match state {
                Some(state) => match state.participant_count {
                    Some(count) => println!("{:?} ({count} participants)", state.phase),
                    None => println!("{:?}", state.phase),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(visibility_tx);
    let _ = poller.await;
}

/// Route to the settlement screen the server asks for. With `wait_interval`,
/// stay on a wait screen and follow the flow until it leaves one.
async fn run_settle(
    api: &ApiClient,
    meeting_id: u64,
    wait_interval: Option<Duration>,
) -> anyhow::Result<()> {
    let mut navigator = ConsoleNavigator::default();
    let mut modal = false;
    let mut action = settlement::route_by_state(
        api,
        &mut navigator,
        meeting_id,
        NavigationMode::Replace,
        || modal = true,
    )
    .await
    .context("failed to fetch settlement state")?;
    info!(?action, "Settlement state");

    if let Some(interval) = wait_interval.filter(|_| action.is_waiting()) {
        println!("waiting on {} ...", navigator.current().unwrap_or("?"));
        tokio::select! {
            next = settlement::follow_wait_screen(
                api,
                &mut navigator,
                meeting_id,
                action,
                interval,
                || modal = true,
            ) => action = next,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
        info!(?action, "Settlement wait finished");
    }

    for (path, _) in &navigator.visits {
        println!("{path}");
    }
    if modal {
        println!("(nothing to settle for this meeting)");
    }
    Ok(())
}

/// Send tracing output to `logs/mealmate.log`; stdout belongs to the console.
/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_path = std::env::current_dir()?.join("logs").join("mealmate.log");
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mealmate=info,warn"));
    let file_layer = fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
