//! Runs a frame loop on the threaded host device.
//!
//! Usage: `cargo run --example frame_loop [config.toml]`. Set `RUST_LOG` to
//! change verbosity (e.g. `RUST_LOG=frame_pipeline=debug`).

use std::time::Duration;

use frame_pipeline::{
    device::host::{HostCommand, HostDevice},
    Backend, Config, Device, HeapKind,
};

const FRAMES: u32 = 120;
const TEXTURE_BYTES: usize = 64 * 64 * 4;

fn init_logging() {
    let mut builder = env_logger::Builder::new();

    if let Ok(filter) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filter);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }

    builder.init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let device = HostDevice::threaded(Duration::from_micros(500));
    let mut backend = Backend::new(device, &config)?;

    // Persistent descriptors for a material, and staged ones that are copied
    // into each frame's transient page.
    let material = backend.allocate_static(HeapKind::CbvSrvUav, 4)?;
    let staged = backend.allocate_staging(HeapKind::CbvSrvUav, 2)?;
    for slot in staged.slots() {
        let handle = backend.cpu_handle(slot)?;
        backend
            .device()
            .write_descriptor(HeapKind::CbvSrvUav, handle, u64::from(slot.index()))?;
    }

    // Upload a "texture" through a context that is waited on before the loop
    // starts.
    let upload = backend.device().create_upload_buffer(TEXTURE_BYTES as u64)?;
    upload.write(0, &[0x7f; TEXTURE_BYTES]);
    {
        let mut recording = backend.record()?;
        recording.track(upload)?;
        recording
            .command_list()?
            .record(HostCommand::CopyFromBuffer {
                bytes: TEXTURE_BYTES as u64,
            })?;
        let value = recording.submit_and_wait()?;
        log::info!("texture uploaded at fence value {value}");
    }

    let mut skipped = 0;
    for frame in 0..FRAMES {
        backend.recycle_completed()?;

        let mut recording = match backend.record() {
            Ok(recording) => recording,
            Err(error) if error.is_backpressure() => {
                log::warn!("frame {frame} skipped: {error}");
                skipped += 1;
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        let table = recording.copy_to_transient(&staged)?;
        let samplers = recording.allocate_transient(HeapKind::Sampler, 1)?;
        let gpu = recording.backend().gpu_handle(table.first())?;
        let material_gpu = recording.backend().gpu_handle(material.first())?;

        recording.command_list()?.record(HostCommand::Marker(format!(
            "frame {frame}: table {:#x}, material {:#x}, samplers at {}",
            gpu.0,
            material_gpu.0,
            samplers.index()
        )))?;

        let value = recording.submit()?;
        log::debug!(
            "frame {frame} submitted at {value}, GPU at {}",
            backend.completed_value()
        );
    }

    backend.flush()?;
    log::info!(
        "{} frames submitted, {skipped} skipped, {} commands executed",
        FRAMES - skipped,
        backend.device().executed_commands().len()
    );

    Ok(())
}
