use std::{error::Error, path::Path, process, str::FromStr, sync::Arc, time::Duration};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use nowplaying::{
    api::WebApi,
    broker::CredentialBroker,
    config::{Config, Credentials},
    connect::WebConnect,
    controller::PlaybackController,
    device::{DeviceManager, SdkLoader},
    http::Client as HttpClient,
    poller::Poller,
    preview::MediaFactory,
    resolver::{TrackResolver, TrackSource},
    signal,
    tokens::TokenProvider,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// TOML file with `client_id`, `client_secret` and `refresh_token`.
    /// Values set in the environment take precedence. Keep this file private:
    /// it grants access to your account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Name of the Connect device to play on
    ///
    /// The device must be visible to your account under this name, for
    /// example a headless Connect receiver on this machine.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// Never play on a Connect device, only previews
    #[arg(long, default_value_t = false)]
    no_device: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Subcommand)]
enum Command {
    /// Exchange an authorization code for a refresh token
    ///
    /// Prints the refresh token to put in the secrets file.
    Authorize {
        /// Code from the authorization redirect
        code: String,

        /// Redirect URI the authorization was requested with
        #[arg(long, value_hint = ValueHint::Url)]
        redirect_uri: Url,
    },
}

/// Commands read from standard input while running.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Input {
    Toggle,
    Hide,
    Show,
    Status,
    Quit,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" | "t" | "p" => Ok(Self::Toggle),
            "hide" => Ok(Self::Hide),
            "show" => Ok(Self::Show),
            "status" | "s" => Ok(Self::Status),
            "quit" | "q" | "exit" => Ok(Self::Quit),
            other => Err(format!(
                "unknown command \"{other}\" (toggle, hide, show, status, quit)"
            )),
        }
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("nowplaying", level);
    }

    logger.init();
}

/// Loads credentials from the environment and the secrets file.
///
/// A missing secrets file is fine if the environment has everything.
///
/// # Errors
///
/// Returns error if the secrets file exists but cannot be read or parsed.
fn load_credentials(secrets_file: &str) -> nowplaying::error::Result<Credentials> {
    let env = Credentials::from_env();

    let file = if Path::new(secrets_file).exists() {
        Credentials::from_file(secrets_file)?
    } else {
        if !env.is_complete() {
            info!("read the documentation on how to set your credentials in {secrets_file}");
        }
        Credentials::default()
    };

    Ok(env.or(file))
}

#[cfg(feature = "audio")]
fn preview_factory(http_client: &HttpClient) -> Option<MediaFactory> {
    use nowplaying::preview::{AudioElement, MediaElement};

    let http_client = http_client.clone();
    Some(Box::new(move || {
        Ok(Box::new(AudioElement::new(http_client.clone())?) as Box<dyn MediaElement>)
    }))
}

#[cfg(not(feature = "audio"))]
fn preview_factory(_http_client: &HttpClient) -> Option<MediaFactory> {
    info!("built without the audio feature; previews are disabled");
    None
}

/// Main application loop.
///
/// # Errors
///
/// Returns error when the credentials are unusable, or when signal handlers
/// cannot be registered.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let credentials = load_credentials(&args.secrets_file)?;
    let mut config = Config::with_credentials(credentials);
    config.device_name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| config.app_name.clone());

    // One client for everything, so that all requests share the rate limit.
    let http_client = HttpClient::new(&config)?;
    let broker = CredentialBroker::new(&config, http_client.clone());
    if let Some(Command::Authorize { code, redirect_uri }) = args.command {
        let refresh_token = broker.authorize(&code, &redirect_uri).await?;
        println!("refresh_token = \"{refresh_token}\"");
        return Ok(());
    }

    let missing = config.credentials.missing();
    if !missing.is_empty() {
        warn!("missing {}", missing.join(", "));
    }

    let tokens: Arc<dyn TokenProvider> = Arc::new(broker);
    let api = Arc::new(WebApi::new(&config, Arc::clone(&tokens), http_client.clone()));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let resolver: Arc<dyn TrackSource> = Arc::new(TrackResolver::new(Arc::clone(&api)));
    let (visibility, visible) = watch::channel(true);
    let mut poller = Poller::new(&config, resolver, visible);
    poller.register(event_tx.clone());
    let now_playing = poller.subscribe();
    let refresh = poller.refresh_handle();

    let sdk = WebConnect::new(&config, Arc::clone(&tokens), http_client.clone());
    let loader = Arc::new(SdkLoader::new(Arc::new(sdk)));
    let mut devices = DeviceManager::new(&config, loader, tokens);
    devices.register(event_tx.clone());
    let mut transport = devices.transport();

    let mut controller = PlaybackController::new(&config, api, preview_factory(&http_client));
    controller.register(event_tx);

    let cancel = CancellationToken::new();
    let mut poller_task = tokio::spawn(poller.run(cancel.clone()));

    // Retry starting the device after sleeping some duration. The first
    // attempt happens immediately.
    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);
    let mut device_pending = !args.no_device;

    let mut signals = signal::Handler::new()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let result: Result<(), Box<dyn Error>> = loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("shutting down gracefully");
                    break Ok(());
                }
                info!("{signal}: refreshing");
                refresh.notify_one();
            }

            result = &mut poller_task => {
                break match result {
                    Ok(result) => result.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
            }

            () = &mut restart_timer, if device_pending => {
                device_pending = false;
                if let Err(e) = devices.start().await {
                    error!("{e}");

                    // Sleep with jitter to not retry in lockstep with other
                    // instances.
                    let duration = Duration::from_millis(fastrand::u64(5_000..6_000));
                    info!("retrying device in {:.1}s", duration.as_secs_f32());
                    restart_timer.as_mut().reset(tokio::time::Instant::now() + duration);
                    device_pending = true;
                }
            }

            Ok(()) = transport.changed() => {
                let update = transport.borrow_and_update().clone();
                controller.apply_device_transport(update);
            }

            Some(event) = event_rx.recv() => {
                debug!("event: {event:?}");
            }

            line = lines.next_line(), if stdin_open => {
                let input = match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => line.parse::<Input>(),
                    Ok(None) => {
                        debug!("standard input closed");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!("unable to read standard input: {e}");
                        stdin_open = false;
                        continue;
                    }
                };

                match input {
                    Ok(Input::Toggle) => {
                        let track = now_playing.borrow().track.clone();
                        let outcome = controller.toggle(track.as_ref(), devices.ready_device()).await;
                        info!("toggle: {outcome}");
                    }
                    Ok(Input::Hide) => {
                        visibility.send_replace(false);
                    }
                    Ok(Input::Show) => {
                        visibility.send_replace(true);
                    }
                    Ok(Input::Status) => {
                        let state = now_playing.borrow().clone();
                        match &state.track {
                            Some(track) if track.is_playing() => info!("now playing: {track}"),
                            Some(track) => info!("last played: {track}"),
                            None if state.loading => info!("loading"),
                            None => info!("nothing to show"),
                        }
                        if state.error {
                            info!("last refresh failed");
                        }
                        let device_ready = devices.device_ready();
                        info!("device: {}", devices.state());
                        info!(
                            "playing: {}; toggle {}",
                            controller.is_playing(),
                            if controller.can_toggle(state.track.as_ref(), device_ready) {
                                "enabled"
                            } else {
                                "disabled"
                            }
                        );
                        if let Some(transport) = controller.transport() {
                            info!(
                                "position: {:.1}s / {:.1}s",
                                transport.position.as_secs_f32(),
                                transport.duration.as_secs_f32()
                            );
                        }
                    }
                    Ok(Input::Quit) => break Ok(()),
                    Err(e) => warn!("{e}"),
                }
            }
        }
    };

    cancel.cancel();
    controller.teardown();
    devices.teardown().await;
    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_commands() {
        assert_eq!(" Toggle ".parse::<Input>(), Ok(Input::Toggle));
        assert_eq!("q".parse::<Input>(), Ok(Input::Quit));
        assert!("play louder".parse::<Input>().is_err());
    }

    #[test]
    fn authorize_subcommand_parses() {
        let args = Args::try_parse_from([
            "nowplaying",
            "authorize",
            "AQB-code",
            "--redirect-uri",
            "http://localhost:3000/api/spotify/callback",
        ])
        .unwrap();
        assert!(matches!(args.command, Some(Command::Authorize { ref code, .. }) if code == "AQB-code"));
    }
}
