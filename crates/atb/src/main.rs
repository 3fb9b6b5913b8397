use std::sync::Arc;

use atb_core::{
    assistant::{api::AssistantsApi, service::AssistantService, tools::ToolRegistry},
    chat::ChatService,
    config::Config,
    store::Store,
    wallet::{PaymentsApi, WalletService},
};
use atb_cryptopay::CryptoPayClient;
use atb_openai::OpenAiClient;
use atb_telegram::router::Services;

/// Crypto Pay is optional; a bad token disables top-ups instead of the bot.
async fn payments(cfg: &Config) -> Option<Arc<dyn PaymentsApi>> {
    let token = cfg.cryptopay_token.as_ref()?;
    let client = match CryptoPayClient::new(token.clone(), cfg.cryptopay_network) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "crypto pay client init failed, payments disabled");
            return None;
        }
    };
    match client.get_me().await {
        Ok(app) => {
            tracing::info!(app = %app.name, network = cfg.cryptopay_network.hostname(), "crypto pay connected");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::error!(error = %e, "crypto pay getMe failed, payments disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), atb_core::Error> {
    atb_core::logging::init("atb")?;

    let cfg = Arc::new(Config::load()?);
    let store = Arc::new(Store::open(&cfg.database_path)?);
    let api: Arc<dyn AssistantsApi> = Arc::new(OpenAiClient::new(&cfg)?);
    let tools = Arc::new(ToolRegistry::with_defaults(reqwest::Client::new()));

    let services = Services {
        assistants: Arc::new(AssistantService::new(
            &cfg,
            store.clone(),
            api.clone(),
            tools.clone(),
        )),
        chat: Arc::new(ChatService::new(
            cfg.clone(),
            store.clone(),
            api.clone(),
            tools,
        )),
        wallet: Arc::new(WalletService::new(
            store.clone(),
            payments(&cfg).await,
            &cfg.cryptopay_asset,
        )),
        store,
        api,
    };

    atb_telegram::router::run_polling(cfg, services)
        .await
        .map_err(|e| atb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
