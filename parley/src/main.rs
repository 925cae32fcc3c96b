//! Parley console - drive the runtime from a terminal.
//!
//! Every stdin line becomes an inbound event for a single console
//! conversation. A few bang commands simulate what a messaging platform
//! would send besides text:
//!
//! - `!click <token>` - press a button
//! - `!pay <amount>` - complete a payment
//! - `!photo <file-id>` / `!file <name>` - send an attachment
//! - `!quit` - shut down

#![allow(clippy::print_stdout)] // console program intentionally uses stdout

use async_trait::async_trait;
use clap::Parser;
use parley::error::Result;
use parley::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Parley console - conversational runtime playground
#[derive(Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Conversation id used for console input
    #[arg(long, default_value = "console:local")]
    conversation: String,

    /// Sender id used for console input
    #[arg(long, default_value = "local")]
    sender: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", parley::error::DisplayError(&e));
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("parley={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path).await?,
        None => RuntimeConfig::default(),
    };
    for issue in config.validate() {
        warn!(field = issue.field, "{}", issue.message);
    }

    let dispatcher = UpdateDispatcher::builder(|ctx: SessionContext| -> Arc<dyn Session> {
        Arc::new(DemoSession::new(ctx))
    })
    .config(config)
    .build();
    dispatcher.start_periodic_maintenance().await;

    let cancel = CancelSource::new();
    let conversation = ConversationId::new(cli.conversation);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("parley console - type /help, Ctrl-D or !quit to exit");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "!quit" {
            break;
        }

        let event = parse_line(&conversation, &cli.sender, line);
        let dispatch = dispatcher.handle_inbound_event(event, cancel.token()).await;
        debug!(outcome = ?dispatch.outcome, "event dispatched");

        match (dispatch.outcome, dispatch.ack) {
            (_, Some(CallbackAck::Rejected(reason))) => println!("  ! {reason}"),
            (DispatchOutcome::Aborted, _) => println!("  ! could not process that"),
            _ => {}
        }
    }

    cancel.cancel();
    let report = dispatcher.shutdown().await;
    let stats = dispatcher.stats().await;
    info!(
        drained = report.drained,
        disposed = report.disposed,
        received = stats.received,
        failed = stats.failed,
        "console closed"
    );
    Ok(())
}

/// Turn one console line into an inbound event.
fn parse_line(conversation: &ConversationId, sender: &str, line: &str) -> InboundEvent {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match head {
        "!click" => InboundEvent::callback(conversation.clone(), sender, rest, "console"),
        "!pay" => InboundEvent::payment(
            conversation.clone(),
            sender,
            Payment {
                currency: "XTR".to_string(),
                total_amount: rest.parse().unwrap_or(0),
                payload: "console".to_string(),
                provider_charge_id: None,
            },
        ),
        "!photo" => InboundEvent::attachment(conversation.clone(), sender, Attachment::photo(rest)),
        "!file" => InboundEvent::attachment(
            conversation.clone(),
            sender,
            Attachment::document(parley::util::generate_id("file"), rest),
        ),
        _ => InboundEvent::text(conversation.clone(), sender, line),
    }
}

// ============================================================================
// Demo session
// ============================================================================

/// A small session that shows off every capability.
struct DemoSession {
    ctx: SessionContext,
    accepted: Mutex<bool>,
    buttons: Mutex<Vec<CallbackToken>>,
    messages: AtomicU64,
    presses: Arc<AtomicU64>,
}

impl DemoSession {
    fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            accepted: Mutex::new(false),
            buttons: Mutex::new(Vec::new()),
            messages: AtomicU64::new(0),
            presses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the previous menu with a fresh one.
    async fn render_menu(&self) {
        let callbacks = &self.ctx.callbacks;
        let mut buttons = self.buttons.lock().await;
        callbacks.unsubscribe_all(buttons.iter()).await;
        buttons.clear();

        let ping = callbacks
            .subscribe(&self.ctx.conversation, |_inv| async {
                println!("pong");
                Ok(())
            })
            .await;

        let presses = Arc::clone(&self.presses);
        let count = callbacks
            .subscribe(&self.ctx.conversation, move |_inv| {
                let n = presses.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    println!("pressed {n} time(s)");
                    Ok(())
                }
            })
            .await;

        let fail = callbacks
            .subscribe(&self.ctx.conversation, |_inv| async {
                Err(SessionError::handler("this button always fails"))
            })
            .await;

        println!("  [ping] !click {ping}");
        println!("  [count] !click {count}");
        println!("  [fail] !click {fail}");
        buttons.extend([ping, count, fail]);
    }
}

#[async_trait]
impl Session for DemoSession {
    async fn needs_acceptance(&self) -> bool {
        !*self.accepted.lock().await
    }

    async fn on_acceptance_required(&self, turn: &Turn) -> SessionResult<()> {
        let accepting = matches!(
            &turn.event.kind,
            EventKind::Message(MessageContent { text: Some(text), .. })
                if text.trim().eq_ignore_ascii_case("/accept")
        );
        if accepting {
            *self.accepted.lock().await = true;
            println!("Thanks! Type /help to see what I can do.");
        } else {
            println!("Please type /accept to agree to the terms first.");
        }
        Ok(())
    }

    async fn on_command(&self, name: &str, args: &[String], _turn: &Turn) -> SessionResult<()> {
        match name {
            "help" => {
                println!("/menu          show buttons");
                println!("/echo <text>   repeat text");
                println!("/stats         message count");
                println!("/panic         crash this turn");
            }
            "menu" => self.render_menu().await,
            "echo" => println!("{}", args.join(" ")),
            "stats" => println!(
                "{} message(s), {} press(es)",
                self.messages.load(Ordering::SeqCst),
                self.presses.load(Ordering::SeqCst)
            ),
            #[allow(clippy::panic)]
            "panic" => panic!("requested from the console"),
            other => return Err(SessionError::handler(format!("unknown command /{other}"))),
        }
        Ok(())
    }

    async fn on_message(&self, text: &str, _turn: &Turn) -> SessionResult<()> {
        let n = self.messages.fetch_add(1, Ordering::SeqCst) + 1;
        println!("#{n} you said: {text}");
        Ok(())
    }

    async fn on_photo(&self, attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        println!("nice photo ({})", attachment.file_id);
        Ok(())
    }

    async fn on_document(&self, attachment: &Attachment, _turn: &Turn) -> SessionResult<()> {
        let name = attachment.file_name.as_deref().unwrap_or("unnamed");
        println!("got file {name}");
        Ok(())
    }

    async fn on_payment(&self, payment: &Payment, _turn: &Turn) -> SessionResult<()> {
        println!("received {} {}", payment.total_amount, payment.currency);
        Ok(())
    }

    async fn on_rejected_callback(&self, reason: RejectReason, _query_id: &str) -> SessionResult<()> {
        debug!(conversation = %self.ctx.conversation, %reason, "button refused");
        Ok(())
    }

    async fn on_error(&self, error: &SessionError) -> SessionResult<()> {
        println!("  ! {error}");
        Ok(())
    }

    fn dispose(&self) {
        debug!(conversation = %self.ctx.conversation, "demo session disposed");
    }
}
