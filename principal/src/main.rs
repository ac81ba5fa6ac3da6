pub mod controller;
pub mod registry;
pub mod services;
pub mod settings;
pub mod store;

use std::sync::Arc;

use dotenv::dotenv;

use crate::controller::run_controller;
use crate::registry::RegistryClient;
use crate::services::autoscaler::ResourceBasedAutoscaler;
use crate::services::machine_sizes::MachineSizeCache;
use crate::services::sizing::SizingController;
use crate::services::validator::ConfigurationValidator;
use crate::settings::Settings;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables into runtime
    dotenv().ok();
    tracing_subscriber::fmt().init();

    let settings = Settings::from_env();
    let store = Arc::new(Store::new());
    let machine_sizes = Arc::new(MachineSizeCache::default());
    let registry = RegistryClient::new()?;

    let validator = ConfigurationValidator::new(store.clone());
    let sizing = SizingController::new(store.clone(), registry);
    let autoscaler = ResourceBasedAutoscaler::new(
        store.clone(),
        machine_sizes,
        settings.management_namespace.clone(),
    );

    tracing::info!(
        management_namespace = %settings.management_namespace,
        "starting cluster sizing control plane"
    );

    tokio::spawn(run_controller(validator, store.clone()));
    tokio::spawn(run_controller(sizing, store.clone()));
    tokio::spawn(run_controller(autoscaler, store.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
