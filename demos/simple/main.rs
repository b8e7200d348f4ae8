use std::sync::Arc;

use nudge::{Campaign, DisplayHandle, EngineConfig, FileStore, HttpTransport, HttpTransportConfig};

#[tokio::main]
async fn main() -> nudge::Result<()> {
    env_logger::init();

    let api_key = std::env::var("NUDGE_API_KEY").unwrap();
    let transport = HttpTransport::new(HttpTransportConfig::from_api_key(api_key))?;
    let store = FileStore::new(std::env::temp_dir().join("nudge-demo"));

    let engine = EngineConfig::new()
        .user_id("demo-user")
        .renderer(|campaign: Arc<Campaign>, handle: DisplayHandle| {
            println!("Showing campaign {:?}: {}", campaign.id, campaign.title);
            // Report the impression without blocking the caller.
            tokio::spawn(async move {
                handle.impression().await;
            });
            true
        })
        .to_engine(Arc::new(transport), Arc::new(store));

    // Load whatever was cached by a previous run, then keep the cache fresh in the background.
    engine.initialize().await?;
    engine.start_periodic_refresh()?;

    // Until the first refresh completes, only previously cached campaigns can match.
    let outcome = engine.wait_for_first_refresh().await;
    println!("First refresh: {outcome:?}");

    engine.set_screen("home");
    let shown = engine.track("app_open", Default::default()).await?;
    println!("Displayed: {:?}", shown.map(|campaign| campaign.id.clone()));

    let report = engine.flush_events().await?;
    println!("Flushed queued events: {report:?}");

    engine.dispose().await;
    Ok(())
}
