use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use crb_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use crb_core::{
    config::Config,
    execution::{ExecutionBackend, ExecutionSwitch},
    messaging::port::MessagingPort,
};

use crate::handlers::{self, repl::ReplRegistry};
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub backend: Arc<dyn ExecutionBackend>,
    /// Throttled messenger used for every reply.
    pub messenger: Arc<dyn MessagingPort>,
    /// Raw adapter, for Telegram-only calls such as message deletion.
    pub telegram: TelegramMessenger,
    pub switch: Arc<ExecutionSwitch>,
    pub repls: Arc<ReplRegistry>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    backend: Arc<dyn ExecutionBackend>,
    switch: Arc<ExecutionSwitch>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "crb started"),
        Err(e) => tracing::warn!("get_me failed: {e}"),
    }
    tracing::info!(
        backend = backend.name(),
        allowed_users = cfg.telegram_allowed_users.len(),
        eval_enabled = switch.is_enabled(),
        "configuration loaded"
    );

    // Multi-block messages fan out into several replies; throttle them. The
    // adapter still retries once on 429 RetryAfter.
    let telegram = TelegramMessenger::new(bot.clone());
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(telegram.clone());
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    // Warm the language cache so the first message does not pay for it.
    {
        let backend = backend.clone();
        tokio::spawn(async move {
            match backend.languages().await {
                Ok(langs) => tracing::info!(count = langs.len(), "language list loaded"),
                Err(e) => tracing::warn!("could not load language list: {e}"),
            }
        });
    }

    let state = Arc::new(AppState {
        cfg,
        backend,
        messenger,
        telegram,
        switch,
        repls: Arc::new(ReplRegistry::default()),
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
