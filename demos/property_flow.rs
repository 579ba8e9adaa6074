//! Property creation walkthrough.
//!
//! This demo shows:
//! - Loading configuration from defaults and `STEPWISE__*` variables
//! - Driving the bundled property flow step by step
//! - Staging a photo and committing it on advance
//! - Resuming a second session from the persisted entity
//! - Observing wizard events and progress
//!
//! Run with: `RUST_LOG=stepwise=debug cargo run --example property_flow`

use serde_json::json;
use std::sync::Arc;
use stepwise::flows::property::{self, PropertyStep};
use stepwise::{
    AdvanceOutcome, EntityBackend, MemoryEntityBackend, PickedFile, ResumeOutcome, Result,
    StepwiseConfig, WizardEvent,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔═══════════════════════════════════════════╗");
    println!("║  Stepwise Property Flow Demo              ║");
    println!("╚═══════════════════════════════════════════╝\n");

    let config = StepwiseConfig::load(None)?;
    let backend = Arc::new(MemoryEntityBackend::new());
    let wizard = property::controller(backend.clone(), config.clone())?;

    let mut events = wizard.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                WizardEvent::StepAdvanced { from, to, .. } => {
                    println!("   [Event] {} -> {}", from, to);
                }
                WizardEvent::AttachmentStaged { field, .. } => {
                    println!("   [Event] attachment staged in '{}'", field);
                }
                WizardEvent::FlowCompleted { entity_id, .. } => {
                    println!("   [Event] property {} published", entity_id);
                }
                _ => {}
            }
        }
    });

    println!("▶️  Basics, amenities, extended amenities");
    println!("─────────────────────────────────────────");
    wizard.update_field("name", json!("Harbor View"))?;
    wizard.update_field("address", json!("7 Quay Street"))?;
    wizard.advance().await?;
    wizard.update_field("amenities", json!(["POOL", "GYM"]))?;
    wizard.advance().await?;
    wizard.update_field("parking_types", json!(["garage", "street parking"]))?;
    wizard.update_field("laundry_types", json!(["coin-op"]))?;
    wizard.advance().await?;

    let rejected = wizard.stage_attachment(
        "photos",
        PickedFile::new("listing.zip", "application/zip", vec![0x50, 0x4B]),
    );
    if let Err(e) = rejected {
        println!("   ✗ {}", e);
    }
    let photo = wizard.stage_attachment(
        "photos",
        PickedFile::new("front.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF]),
    )?;
    println!("   preview: {}", photo.preview_url);

    println!("\n📊 Progress before photos are committed:");
    println!("{}", wizard.progress()?);

    // Leave the first session mid-way; the entity keeps what was persisted.
    let entity_id = wizard.entity_id()?.unwrap_or_else(|| stepwise::EntityId::new("missing"));
    wizard.discard();

    println!("↩️  Resuming from entity {}", entity_id);
    println!("─────────────────────────────────────────");
    let resumed = property::controller(backend.clone(), config)?;
    if let Some(entity) = backend.fetch(property::RESOURCE, &entity_id).await? {
        if let ResumeOutcome::Resumed(decision) = resumed.jump_to_resumed_step(&entity)? {
            println!("   landed on '{:?}' ({:?})", decision.step, decision.basis);
        }
    }

    resumed.stage_attachment(
        "photos",
        PickedFile::new("front.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF]),
    )?;
    resumed.advance().await?;
    resumed.update_field("description", json!("Waterfront flats with balconies"))?;
    resumed.update_field("ribbon", json!("new construction"))?;
    resumed.advance().await?;
    resumed.update_field("rent", json!(2450))?;
    resumed.advance().await?;

    if resumed.current_step()? == PropertyStep::Review {
        if let AdvanceOutcome::Completed { entity: Some(entity) } = resumed.advance().await? {
            println!("\n✅ Published:");
            println!("{}", serde_json::to_string_pretty(&entity.data)?);
        }
    }

    Ok(())
}
