//! Command and dialogue handlers
//!
//! Every handler translates one operator interaction into a coordinator
//! call and a reply. Errors from the coordinator are typed; they are
//! rendered for the operator, never propagated as faults.

use crate::bot::state::State;
use crate::coordinator::RelayCoordinator;
use crate::error::{CancelError, EnqueueError};
use crate::session::LoginResult;
use anyhow::Result;
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

/// Dialogue handle for the login flow
pub type BotDialogue = Dialogue<State, InMemStorage<State>>;

/// Supported operator commands
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    /// Greeting
    #[command(description = "start the bot.")]
    Start,
    /// Usage text
    #[command(description = "display command usage.")]
    Help,
    /// Start the two-step login flow
    #[command(description = "set up your user session.")]
    Login,
    /// Queue one relay job
    #[command(description = "queue a media relay: /batch <link> <destination>.", parse_with = "split")]
    Batch {
        /// Source link
        link: String,
        /// Destination locator
        destination: String,
    },
    /// Bind a proxy for future connections
    #[command(description = "set up a proxy for better connectivity.")]
    SetProxy {
        /// Proxy address, e.g. 10.0.0.1:1080
        address: String,
    },
    /// Remove the proxy binding
    #[command(description = "remove proxy setup.")]
    RemProxy,
    /// Cancel a queued job
    #[command(description = "cancel a queued job: /cancel <job id>.")]
    Cancel {
        /// Job identifier reported by /batch
        job_id: u64,
    },
    /// Usage counters
    #[command(description = "view your usage statistics.")]
    Stats,
    /// Revoke the user session
    #[command(description = "log out from your session.")]
    Logout,
}

/// Extract the sender's ID, defaulting to 0 for service messages
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .unwrap_or(0)
}

/// Dispatch one parsed command
///
/// # Errors
///
/// Returns an error only when Telegram itself rejects the reply.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    match cmd {
        Command::Start => {
            bot.send_message(
                msg.chat.id,
                "Welcome! Use /login to log in with your phone number.",
            )
            .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
        Command::Login => {
            dialogue.update(State::AwaitingPhone).await?;
            bot.send_message(msg.chat.id, "Please send me your phone number to log in.")
                .await?;
        }
        Command::Batch { link, destination } => {
            batch(&bot, &msg, &coordinator, user_id, link, destination).await?;
        }
        Command::SetProxy { address } => {
            coordinator.bind_proxy(user_id, address.clone()).await;
            bot.send_message(
                msg.chat.id,
                format!("Proxy set up with address: {address} (applies to future logins)"),
            )
            .await?;
        }
        Command::RemProxy => {
            coordinator.clear_proxy(user_id).await;
            bot.send_message(msg.chat.id, "Proxy setup removed.").await?;
        }
        Command::Cancel { job_id } => {
            cancel(&bot, &msg, &coordinator, job_id).await?;
        }
        Command::Stats => {
            let counters = coordinator.stats(user_id).await;
            bot.send_message(
                msg.chat.id,
                format!(
                    "User stats:\nMessages relayed: {}\nMedia bytes relayed: {}",
                    counters.messages_relayed, counters.media_bytes_relayed
                ),
            )
            .await?;
        }
        Command::Logout => {
            if coordinator.is_active(user_id).await {
                coordinator.revoke(user_id).await;
                bot.send_message(msg.chat.id, "Logged out successfully!")
                    .await?;
            } else {
                coordinator.revoke(user_id).await;
                bot.send_message(msg.chat.id, "No active session to log out from.")
                    .await?;
            }
        }
    }
    Ok(())
}

async fn batch(
    bot: &Bot,
    msg: &Message,
    coordinator: &RelayCoordinator,
    user_id: i64,
    link: String,
    destination: String,
) -> Result<()> {
    match coordinator.enqueue(user_id, link.clone(), destination).await {
        Ok(job_id) => {
            bot.send_message(
                msg.chat.id,
                format!("Queued relay job #{job_id} for {link}. Use /cancel {job_id} while it waits."),
            )
            .await?;
        }
        Err(EnqueueError::NotAuthenticated) => {
            bot.send_message(
                msg.chat.id,
                "You are not logged in. Use /login to set up your user session first.",
            )
            .await?;
        }
        Err(EnqueueError::QueueFull(bound)) => {
            bot.send_message(
                msg.chat.id,
                format!("Your queue is full ({bound} jobs). Wait for one to finish and retry."),
            )
            .await?;
        }
    }
    Ok(())
}

async fn cancel(
    bot: &Bot,
    msg: &Message,
    coordinator: &RelayCoordinator,
    job_id: u64,
) -> Result<()> {
    match coordinator.cancel(job_id).await {
        Ok(()) => {
            bot.send_message(msg.chat.id, format!("Job #{job_id} cancelled."))
                .await?;
        }
        Err(CancelError::InvalidState(_)) => {
            bot.send_message(
                msg.chat.id,
                format!("Job #{job_id} is already running or finished; only queued jobs can be cancelled."),
            )
            .await?;
        }
        Err(CancelError::NotFound(_)) => {
            bot.send_message(msg.chat.id, format!("No job #{job_id} found."))
                .await?;
        }
    }
    Ok(())
}

/// Handle the phone number sent after `/login`
///
/// # Errors
///
/// Returns an error only when Telegram itself rejects the reply.
pub async fn handle_phone(
    bot: Bot,
    msg: Message,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let Some(phone_number) = msg.text().map(str::trim) else {
        bot.send_message(msg.chat.id, "Please send your phone number as text.")
            .await?;
        return Ok(());
    };

    bot.send_message(msg.chat.id, "Logging in with the provided phone number...")
        .await?;

    match coordinator.begin_login(user_id, phone_number).await {
        Ok(LoginResult::Active) => {
            dialogue.update(State::Idle).await?;
            bot.send_message(msg.chat.id, "Logged in successfully!")
                .await?;
        }
        Ok(LoginResult::AwaitingSecondFactor) => {
            dialogue.update(State::AwaitingSecondFactor).await?;
            bot.send_message(
                msg.chat.id,
                "Two-step verification is enabled. Please send your verification code.",
            )
            .await?;
        }
        Err(e) => {
            dialogue.update(State::Idle).await?;
            bot.send_message(
                msg.chat.id,
                format!("Login failed: {e}. Please check your phone number and try again."),
            )
            .await?;
        }
    }
    Ok(())
}

/// Handle the second-factor code for a pending login
///
/// # Errors
///
/// Returns an error only when Telegram itself rejects the reply.
pub async fn handle_second_factor(
    bot: Bot,
    msg: Message,
    coordinator: Arc<RelayCoordinator>,
    dialogue: BotDialogue,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let Some(code) = msg.text().map(str::trim) else {
        bot.send_message(msg.chat.id, "Please send your verification code as text.")
            .await?;
        return Ok(());
    };

    match coordinator.complete_login(user_id, code).await {
        Ok(()) => {
            dialogue.update(State::Idle).await?;
            bot.send_message(msg.chat.id, "Logged in successfully!")
                .await?;
        }
        Err(crate::error::SessionError::SecondFactor(reason)) => {
            // Stay in the dialogue so the operator can retry the code.
            bot.send_message(msg.chat.id, format!("Code rejected: {reason}. Try again."))
                .await?;
        }
        Err(e) => {
            dialogue.update(State::Idle).await?;
            bot.send_message(msg.chat.id, format!("Login failed: {e}."))
                .await?;
        }
    }
    Ok(())
}
