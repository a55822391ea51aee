use chrono::Local;
use clap::{Parser, ValueEnum};
use contact_rtc::account::AccountClient;
use contact_rtc::logger;
use contact_rtc::peer::{DisplayFeed, PeerEvent, SampleDisplaySource};
use contact_rtc::{ClientConfig, Error, Session, SurfaceKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "contact-rtc")]
#[command(about = "Chat or share a screen with a contact over WebRTC")]
struct Cli {
    /// Our username; looked up through the account API when omitted
    #[arg(long)]
    user: Option<String>,

    /// Username of the contact to connect to
    #[arg(long)]
    contact: String,

    #[arg(long, value_enum, default_value_t = Mode::Chat)]
    mode: Mode,

    /// Access token for the account API
    #[arg(long, env = "CONTACT_RTC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// In screen mode, offer a display capture fed by this host
    #[arg(long)]
    share: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Chat,
    Screen,
}

impl From<Mode> for SurfaceKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Chat => SurfaceKind::Chat,
            Mode::Screen => SurfaceKind::ScreenShare,
        }
    }
}

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("contact-rtc failed: {}", e);
        std::process::exit(1);
    }
}

fn stamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

async fn resolve_user(config: &ClientConfig, token: Option<&str>) -> contact_rtc::Result<String> {
    let token = token.ok_or_else(|| {
        Error::Config("pass --user, or a token so the username can be looked up".into())
    })?;
    let account = AccountClient::from_config(config)?.with_token(token);
    let me = account.user_info().await?;
    info!(username = %me.username, contacts = me.contacts.len(), "resolved account");
    Ok(me.username)
}

async fn run(cli: Cli) -> contact_rtc::Result<()> {
    let config = ClientConfig::from_env()?;
    let user = match cli.user {
        Some(user) => user,
        None => resolve_user(&config, cli.token.as_deref()).await?,
    };
    let kind = SurfaceKind::from(cli.mode);

    let session = Session::with_http_signaling(&config, kind, user.clone(), cli.contact.clone())?;
    let mut events = session.events();
    let negotiation = session.connect().await?;
    println!("[{}] {} -> {} ({:?})", stamp(), user, cli.contact, kind);

    let mut negotiation = Box::pin(negotiation.wait());
    let mut negotiating = true;
    let mut display: Option<DisplayFeed> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            report = &mut negotiation, if negotiating => {
                negotiating = false;
                match report {
                    Some(report) if report.outcome.is_established() => {
                        println!("[{}] negotiated after {} attempt(s)", stamp(), report.state.attempt);
                        if cli.share && kind == SurfaceKind::ScreenShare {
                            display = share_display(&session).await;
                        }
                    }
                    Some(report) => {
                        println!(
                            "[{}] no session with {}: {:?}",
                            stamp(),
                            cli.contact,
                            report.outcome
                        );
                        break;
                    }
                    None => break,
                }
            }
            event = events.recv() => match event {
                Ok(PeerEvent::StatusChanged(status)) => println!("[{}] {}", stamp(), status),
                Ok(PeerEvent::Message(text)) => println!("[{}] {}: {}", stamp(), cli.contact, text),
                Ok(PeerEvent::ChannelOpened { label }) => println!("[{}] channel {} open", stamp(), label),
                Ok(PeerEvent::ChannelClosed { label }) => println!("[{}] channel {} closed", stamp(), label),
                Ok(PeerEvent::TrackReceived { kind, id }) => {
                    println!("[{}] receiving {} track {}", stamp(), kind, id)
                }
                Ok(PeerEvent::DescriptionGathered(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match kind {
                        SurfaceKind::Chat => {
                            if !session.send(text).await? {
                                println!("[{}] not connected yet; message dropped", stamp());
                            }
                        }
                        SurfaceKind::ScreenShare if text == "stop" => {
                            if display.take().is_some() {
                                println!("[{}] screen sharing stopped", stamp());
                            }
                        }
                        SurfaceKind::ScreenShare => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(display);
    session.close().await;
    Ok(())
}

async fn share_display(session: &Session) -> Option<DisplayFeed> {
    let (source, mut feeds) = SampleDisplaySource::new();
    if let Err(e) = session.start_screen_share(&source).await {
        println!("[{}] screen sharing unavailable: {}", stamp(), e);
        return None;
    }
    println!("[{}] screen sharing started; type `stop` to end it", stamp());
    feeds.recv().await
}
