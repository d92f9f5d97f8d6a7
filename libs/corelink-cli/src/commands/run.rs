// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use corelink::core::owner::CoreOwner;
use corelink::{
    CapturedImage, ChannelOwner, CoreManager, CoreRegistry, ManagerConfig, ManagerStrategy,
    OwnerEvent, StartupInfo, create_manager,
};
use tokio::sync::mpsc::UnboundedReceiver;

use super::inspect::CLI_SYSTEM;

pub struct RunOptions {
    pub rom: PathBuf,
    pub core: PathBuf,
    pub strategy: Option<ManagerStrategy>,
    pub config_dir: Option<PathBuf>,
    pub helper: Option<PathBuf>,
    pub seconds: f64,
    pub save_state: Option<PathBuf>,
    pub load_state: Option<PathBuf>,
    pub screenshot: Option<PathBuf>,
    pub volume: Option<f32>,
}

fn manager_config(options: &RunOptions) -> Result<ManagerConfig> {
    let dir = match &options.config_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    let mut config = ManagerConfig::load_or_default(&dir);
    if let Some(strategy) = options.strategy {
        config = config.with_strategy(strategy);
    }
    if let Some(helper) = &options.helper {
        config = config.with_helper_path(helper);
    }
    Ok(config)
}

/// Load a ROM, run it for `seconds`, then stop it cleanly.
pub async fn run(options: RunOptions) -> Result<()> {
    let config = manager_config(&options)?;
    let info = StartupInfo::for_rom(&options.rom, &options.core, CLI_SYSTEM)
        .with_context(|| format!("Failed to read {}", options.rom.display()))?;

    let (owner, events) = ChannelOwner::new();
    let owner_ref: Arc<dyn CoreOwner> = owner.clone();
    let manager = create_manager(
        &config,
        CoreRegistry::with_builtin_cores(),
        Arc::downgrade(&owner_ref),
    )
    .context("Failed to create core manager")?;
    let watcher = tokio::spawn(watch_events(Arc::downgrade(&manager), events));

    println!(
        "Running {} ({:?}) for {:.1}s",
        options.rom.display(),
        config.strategy,
        options.seconds
    );

    let outcome = drive(manager.as_ref(), info, &options).await;
    if outcome.is_err() {
        manager.shutdown();
    }
    drop(manager);
    drop(owner_ref);
    drop(owner);
    let _ = watcher.await;
    outcome
}

async fn drive(manager: &dyn CoreManager, info: StartupInfo, options: &RunOptions) -> Result<()> {
    let load = manager.load_rom(info);
    let setup = manager.setup();
    load.await.context("Failed to load ROM")?;
    let setup = setup.await.context("Core setup failed")?;
    println!(
        "Core ready: screen {}, aspect {}",
        setup.screen_size, setup.aspect_size
    );

    if let Some(path) = &options.load_state {
        manager
            .load_state(path.clone())
            .await
            .with_context(|| format!("Failed to load state from {}", path.display()))?;
    }
    if let Some(volume) = options.volume {
        manager.set_volume(volume).await?;
    }

    manager.start().await.context("Failed to start core")?;
    tokio::time::sleep(Duration::from_secs_f64(options.seconds.max(0.0))).await;

    if let Some(path) = &options.screenshot {
        let image = manager
            .capture_output_image()
            .await
            .context("Failed to capture output image")?;
        write_ppm(path, &image)?;
        println!("Screenshot written to {}", path.display());
    }
    if let Some(path) = &options.save_state {
        manager
            .save_state(path.clone())
            .await
            .with_context(|| format!("Failed to save state to {}", path.display()))?;
        println!("State saved to {}", path.display());
    }

    manager.stop().await.context("Failed to stop core")?;
    println!("Core stopped");
    Ok(())
}

async fn watch_events(manager: Weak<dyn CoreManager>, mut events: UnboundedReceiver<OwnerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            OwnerEvent::RenderContext(handle) => {
                let Some(manager) = manager.upgrade() else {
                    continue;
                };
                match manager.bind_render_context(handle) {
                    Ok(layer) => tracing::info!("Bound presentation layer {:?}", layer),
                    Err(e) => tracing::warn!("Could not bind {}: {}", handle, e),
                }
            }
            OwnerEvent::Notification(notification) => {
                tracing::info!("Core requested {:?}", notification);
            }
            OwnerEvent::Terminated => {
                tracing::error!("Core terminated unexpectedly");
            }
        }
    }
}

/// Binary PPM (P6); alpha is dropped.
fn write_ppm(path: &Path, image: &CapturedImage) -> Result<()> {
    let mut out = Vec::with_capacity(image.size.width as usize * image.size.height as usize * 3 + 32);
    write!(out, "P6\n{} {}\n255\n", image.size.width, image.size.height)?;
    for pixel in image.pixels.chunks_exact(4) {
        out.extend_from_slice(&pixel[..3]);
    }
    std::fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
