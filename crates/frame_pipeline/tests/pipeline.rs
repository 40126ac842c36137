use std::time::Duration;

use frame_pipeline::{
    device::host::{HostCommand, HostDevice, Retirement},
    Backend, Config, Device, DeviceError, Error, Exhausted, HeapKind,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn backend(retirement: Retirement, pool_size: u32) -> Backend<HostDevice> {
    init_logging();

    let config = Config {
        context_pool_size: Some(pool_size),
        ..Config::default()
    };

    Backend::new(HostDevice::with_retirement(retirement), &config).unwrap()
}

fn assert_conserved(backend: &Backend<HostDevice>) {
    let pool = backend.pool();
    assert_eq!(
        pool.available_count() + pool.pending_count() + pool.active_count(),
        pool.size()
    );
}

#[test]
fn fourth_frame_waits_for_the_first() {
    let mut backend = backend(Retirement::OnWait, 3);
    let upload = backend.device().create_upload_buffer(256).unwrap();

    let mut first_slot = None;
    for expected in 1..=3 {
        let context = backend.get_new_command_context().unwrap();
        if first_slot.is_none() {
            first_slot = Some(context.slot());
            backend.track_resource(&context, upload.clone()).unwrap();
            backend
                .allocate_transient(&context, HeapKind::CbvSrvUav, 32)
                .unwrap();
            backend
                .allocate_transient(&context, HeapKind::Sampler, 4)
                .unwrap();
        }
        assert_eq!(backend.submit(context, false).unwrap(), expected);
    }

    let context = backend.get_new_command_context().unwrap();
    assert_eq!(Some(context.slot()), first_slot);
    assert_eq!(backend.completed_value(), 1);
    assert_eq!(backend.pool().pending_targets().collect::<Vec<_>>(), [2, 3]);

    let recycled = backend.pool().context(&context).unwrap();
    assert_eq!(recycled.tracked_resources(), 0);
    assert_eq!(upload.holders(), 1);
    for kind in [HeapKind::CbvSrvUav, HeapKind::Sampler] {
        let page = recycled.page(kind).unwrap();
        let collection = backend.descriptors().collection(kind);
        assert_eq!(collection.page(page.index()).unwrap().top(), 0);
    }

    backend.submit(context, false).unwrap();
    backend.flush().unwrap();
    assert_eq!(backend.completed_value(), 4);
}

#[test]
fn contexts_recycle_in_submission_order_under_jitter() {
    let mut backend = backend(Retirement::Manual, 4);
    let jitter = [0, 3, 1, 0, 0, 4, 2, 1, 0, 5, 3, 0, 1, 2, 0, 6];

    let mut submitted = std::collections::VecDeque::new();

    for retire in jitter {
        for _ in 0..retire {
            backend.device().retire_next();
        }

        let before = backend.pool().pending_count();
        let recycled = backend.recycle_completed().unwrap();
        for _ in 0..recycled {
            let target = submitted.pop_front().unwrap();
            assert!(target <= backend.completed_value());
        }
        assert_eq!(backend.pool().pending_count(), before - recycled);

        if let Some(&oldest) = submitted.front() {
            assert!(oldest > backend.completed_value(), "a completed entry was skipped");
        }

        // Keep acquisition from blocking on a queue nothing will retire.
        if backend.pool().available_count() == 0 {
            let oldest = backend.pool().pending_targets().next().unwrap();
            backend.device().retire_until(backend.fence().raw(), oldest);
        }

        let context = backend.get_new_command_context().unwrap();
        assert_conserved(&backend);
        if backend.pool().pending_count() < submitted.len() {
            submitted.pop_front();
        }

        let target = backend.submit(context, false).unwrap();
        submitted.push_back(target);
        assert_conserved(&backend);

        let pending: Vec<_> = backend.pool().pending_targets().collect();
        assert!(pending.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(pending, submitted.iter().copied().collect::<Vec<_>>());
    }

    backend.device().retire_all();
    backend.flush().unwrap();
    assert_eq!(backend.pool().available_count(), 4);
}

#[test]
fn staged_descriptors_reach_shaders_through_transient_pages() {
    let mut backend = backend(Retirement::OnWait, 2);

    let staged = backend.allocate_staging(HeapKind::CbvSrvUav, 4).unwrap();
    for slot in staged.slots() {
        let handle = backend.cpu_handle(slot).unwrap();
        backend
            .device()
            .write_descriptor(HeapKind::CbvSrvUav, handle, 0xd00d + u64::from(slot.offset()))
            .unwrap();
    }

    assert!(matches!(
        backend.gpu_handle(staged.first()),
        Err(Error::NotShaderVisible(HeapKind::CbvSrvUav))
    ));

    let mut recording = backend.record().unwrap();
    let table = recording.copy_to_transient(&staged).unwrap();
    assert_eq!(table.size(), 4);

    for (source, slot) in staged.slots().zip(table.slots()) {
        let backend = recording.backend();
        let cpu = backend.cpu_handle(source).unwrap();
        let gpu = backend.gpu_handle(slot).unwrap();

        let staged_payload = backend.device().read_descriptor(HeapKind::CbvSrvUav, cpu).unwrap();
        let payload = backend
            .device()
            .read_gpu_descriptor(HeapKind::CbvSrvUav, gpu)
            .unwrap();
        assert_eq!(payload, staged_payload);
        assert_eq!(payload, 0xd00d + u64::from(slot.offset()));
    }

    recording.submit_and_wait().unwrap();
}

#[test]
fn static_descriptors_survive_frames() {
    let mut backend = backend(Retirement::OnWait, 2);

    let material = backend.allocate_static(HeapKind::CbvSrvUav, 3).unwrap();
    let first = backend.gpu_handle(material.at(2)).unwrap();

    for _ in 0..5 {
        let mut recording = backend.record().unwrap();
        recording.allocate_transient(HeapKind::CbvSrvUav, 64).unwrap();
        recording.submit().unwrap();
    }
    backend.flush().unwrap();

    assert_eq!(backend.gpu_handle(material.at(2)).unwrap(), first);
}

#[test]
fn upload_buffers_live_until_their_frame_retires() {
    let mut backend = backend(Retirement::Manual, 2);
    let buffer = backend.device().create_upload_buffer(1024).unwrap();
    buffer.write(0, &[0xff; 64]);

    let mut recording = backend.record().unwrap();
    recording.track(buffer.clone()).unwrap();
    recording
        .command_list()
        .unwrap()
        .record(HostCommand::CopyFromBuffer { bytes: 64 })
        .unwrap();
    recording.submit().unwrap();

    assert_eq!(buffer.holders(), 2);
    backend.recycle_completed().unwrap();
    assert_eq!(buffer.holders(), 2);

    backend.device().retire_all();
    assert_eq!(backend.recycle_completed().unwrap(), 1);
    assert_eq!(buffer.holders(), 1);
    assert_eq!(
        backend.device().executed_commands(),
        [HostCommand::CopyFromBuffer { bytes: 64 }]
    );
}

#[test]
fn exhausted_pages_are_reported_as_backpressure() {
    init_logging();

    let mut config = Config {
        context_pool_size: Some(3),
        ..Config::default()
    };
    config.descriptors.sampler.page_count = 2;

    let mut backend = Backend::new(HostDevice::with_retirement(Retirement::Manual), &config).unwrap();

    let a = backend.get_new_command_context().unwrap();
    let b = backend.get_new_command_context().unwrap();

    let error = backend.get_new_command_context().unwrap_err();
    assert!(error.is_backpressure());
    assert!(matches!(
        error,
        Error::PoolExhausted(Exhausted::Pages(HeapKind::Sampler))
    ));
    assert_conserved(&backend);

    backend.submit(a, false).unwrap();
    backend.release(b).unwrap();

    let c = backend.get_new_command_context().unwrap();
    backend.release(c).unwrap();

    backend.device().retire_all();
    backend.flush().unwrap();
}

#[test]
fn device_loss_is_fatal() {
    let mut backend = backend(Retirement::Manual, 2);

    let context = backend.get_new_command_context().unwrap();
    backend.submit(context, false).unwrap();

    backend.device().lose_device();

    let error = backend.get_new_command_context().unwrap_err();
    assert!(matches!(error, Error::Device(DeviceError::Lost)));
    assert!(!error.is_backpressure());

    assert!(matches!(
        backend.flush(),
        Err(Error::Device(DeviceError::Lost))
    ));
}

#[test]
fn threaded_frame_loop_drains() {
    init_logging();

    let device = HostDevice::threaded(Duration::from_micros(200));
    let mut backend = Backend::new(device, &Config::default()).unwrap();

    let mut last = 0;
    for frame in 0..32 {
        let mut recording = backend.record().unwrap();
        recording.allocate_transient(HeapKind::Sampler, 2).unwrap();
        recording
            .command_list()
            .unwrap()
            .record(HostCommand::Marker(format!("frame {frame}")))
            .unwrap();

        let target = recording.submit().unwrap();
        assert_eq!(target, last + 1);
        last = target;
        assert_conserved(&backend);
    }

    backend.flush().unwrap();
    assert_eq!(backend.completed_value(), last);
    assert_eq!(backend.pool().available_count(), backend.pool().size());
    assert_eq!(backend.device().executed_commands().len(), 32);
}
