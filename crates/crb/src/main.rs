use std::sync::Arc;

use crb_core::{
    config::{BackendKind, Config},
    execution::{ExecutionBackend, ExecutionSwitch},
};
use crb_piston::PistonClient;
use crb_sandbox::LocalBackend;

#[tokio::main]
async fn main() -> Result<(), crb_core::Error> {
    crb_core::logging::init("crb")?;

    let cfg = Arc::new(Config::load()?);
    let switch = Arc::new(ExecutionSwitch::new(cfg.enable_eval));

    let backend: Arc<dyn ExecutionBackend> = match cfg.backend {
        BackendKind::Piston => Arc::new(PistonClient::new(cfg.execution.clone())?),
        BackendKind::Local => Arc::new(LocalBackend::new(cfg.sandbox.clone(), switch.clone())),
    };

    crb_telegram::router::run_polling(cfg, backend, switch)
        .await
        .map_err(|e| crb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
