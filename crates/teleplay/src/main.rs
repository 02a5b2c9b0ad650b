use std::sync::Arc;

use teleplay_core::{
    bot::Bot,
    checkpoint::CheckpointStore,
    config::Config,
    handler::EchoHandler,
    poll::LoopEvent,
    session::BotSession,
    source::SourceError,
    store::FileStore,
};
use teleplay_telegram::TelegramClient;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), teleplay_core::Error> {
    teleplay_core::logging::init("teleplay")?;

    let cfg = Config::load()?;
    info!(config = ?cfg, "configuration loaded");

    let client = Arc::new(TelegramClient::new(
        cfg.bot_token.clone(),
        cfg.api_base.clone(),
        cfg.poll_timeout,
    )?);

    match client.get_me().await {
        Ok(me) => info!(
            bot_id = me.id,
            username = me.username.as_deref().unwrap_or("<none>"),
            "bot identity verified"
        ),
        Err(SourceError::Fatal(reason)) => return Err(teleplay_core::Error::Fatal(reason)),
        Err(e) => warn!(error = %e, "could not verify bot identity, starting anyway"),
    }

    let checkpoints = Arc::new(CheckpointStore::new(Arc::new(FileStore::new(
        cfg.checkpoint_file.clone(),
    ))));
    let session = BotSession::new(
        cfg.bot_token.clone(),
        Arc::new(EchoHandler::new(cfg.reply_prefix.clone())),
    )
    .with_concurrency_limit(cfg.concurrency_limit)?;

    let bot = Arc::new(Bot::new(session, client, checkpoints).with_settings(cfg.poll_settings()));

    let mut events = bot.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LoopEvent::Fetched { offset, count }) if count > 0 => {
                    info!(offset, count, "fetched updates")
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl = bot.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current iteration");
            ctrl.stop();
        }
    });

    bot.start();
    match bot.wait().await {
        Some(Ok(summary)) => {
            info!(
                iterations = summary.iterations,
                fetched = summary.fetched,
                replied = summary.replied,
                handler_failures = summary.handler_failures,
                send_failures = summary.send_failures,
                "bot stopped"
            );
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => Ok(()),
    }
}
