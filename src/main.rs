use dotenvy::dotenv;
use media_relay_bot::bot::handlers::{
    get_user_id_safe, handle_command as dispatch_command, handle_phone, handle_second_factor,
    BotDialogue, Command,
};
use media_relay_bot::bot::state::State;
use media_relay_bot::config::{self, RelayConfig, Settings};
use media_relay_bot::coordinator::RelayCoordinator;
use media_relay_bot::transport::{HttpRelayTransport, UserTransport};
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data from log output.
///
/// Operators hand this bot their phone numbers; neither those nor the bot
/// token may ever reach the logs.
struct RedactionPatterns {
    bot_token_url: Regex,
    bot_token_bare: Regex,
    phone: Regex,
}

impl RedactionPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bot_token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            bot_token_bare: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            phone: Regex::new(r"\+[0-9]{7,15}")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .bot_token_url
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .bot_token_bare
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self.phone.replace_all(&output, "[PHONE]").to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length to satisfy the contract, even when
        // the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            patterns: self.patterns.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile redaction patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting Media Relay Bot...");

    let settings = init_settings();

    let transport: Arc<dyn UserTransport> = Arc::new(HttpRelayTransport::new()?);
    let coordinator = RelayCoordinator::new(
        transport,
        RelayConfig::default(),
        config::MAX_QUEUE_DEPTH,
    );
    let _supervisor =
        coordinator.start_supervisor(Duration::from_secs(config::SUPERVISOR_INTERVAL_SECS));
    info!("Coordinator initialized.");

    let bot = Bot::new(settings.telegram_token.clone());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            coordinator,
            settings,
            InMemStorage::<State>::new()
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        patterns,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(
        Update::filter_message()
            .branch(
                dptree::filter(|msg: Message, settings: Arc<Settings>| {
                    settings.allowed_users().contains(&get_user_id_safe(&msg))
                })
                .enter_dialogue::<Message, InMemStorage<State>, State>()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::case![State::AwaitingPhone].endpoint(handle_awaiting_phone))
                .branch(
                    dptree::case![State::AwaitingSecondFactor]
                        .endpoint(handle_awaiting_second_factor),
                ),
            )
            .branch(Update::filter_message().endpoint(handle_unauthorized)),
    )
}

async fn handle_unauthorized(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    warn!("Unauthorized access from user {}.", user_id);
    if let Err(e) = bot.send_message(msg.chat.id, "Access denied").await {
        error!("Failed to send access denied message to {}: {}", user_id, e);
    }
    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = dispatch_command(bot, msg, cmd, coordinator, dialogue).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_awaiting_phone(
    bot: Bot,
    msg: Message,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handle_phone(bot, msg, coordinator, dialogue).await {
        error!("Phone handler error: {}", e);
    }
    respond(())
}

async fn handle_awaiting_second_factor(
    bot: Bot,
    msg: Message,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handle_second_factor(bot, msg, coordinator, dialogue).await {
        error!("Second factor handler error: {}", e);
    }
    respond(())
}
