//! This example program runs the capture pipeline against the simulated
//! hardware of `vfer::hw::sim`.
//!
//! A timer thread plays the part of the interrupt controller and raises a
//! frame-done interrupt (preceded by a vsync when the ISP is used) at every
//! frame interval. Completed buffers are printed and queued again, until
//! Ctrl-C is pressed or the requested number of frames has been captured.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use log::warn;
use vfer::device::{
    negotiate_buffer_count, BufferSink, CompletedBuffer, Device, DeviceConfig, DevicePorts,
    Isp3aPorts, VideoBuffer,
};
use vfer::hw::sim::{SimCsi, SimIsp, SimSensor};
use vfer::hw::CsiIrq;
use vfer::isp::{Isp3aResult, StatSections};
use vfer::memory::{DmaAllocator, HeapAllocator};
use vfer::{BufferStatus, CaptureMode};

/// Forwards completed buffers to the main thread.
struct ChannelSink(mpsc::Sender<CompletedBuffer>);

impl BufferSink for ChannelSink {
    fn buffer_done(&self, buffer: CompletedBuffer) {
        // The main thread may be gone already while we are shutting down.
        let _ = self.0.send(buffer);
    }
}

/// Toy 3A: nudges the exposure up or down depending on the mean of the
/// histogram section.
fn toy_3a(sections: &StatSections<'_>, prev: &Isp3aResult) -> anyhow::Result<Isp3aResult> {
    if sections.hist.is_empty() {
        anyhow::bail!("empty histogram");
    }
    let mean = sections.hist.iter().map(|b| *b as u32).sum::<u32>() / sections.hist.len() as u32;
    let exp_line_num = match mean {
        0..=99 => prev.exp_line_num + 10,
        100..=155 => prev.exp_line_num,
        _ => (prev.exp_line_num - 10).max(1),
    };

    Ok(Isp3aResult {
        exp_line_num: exp_line_num.max(1),
        ..prev.clone()
    })
}

fn main() {
    env_logger::init();

    let matches = App::new("vfer simulated capture")
        .arg(
            Arg::with_name("isp")
                .long("isp")
                .help("Route frames through the ISP and run 3A on its statistics"),
        )
        .arg(
            Arg::with_name("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after capturing this number of frames"),
        )
        .arg(
            Arg::with_name("num_buffers")
                .long("buffers")
                .takes_value(true)
                .default_value("0")
                .help("Number of buffers to request (0 for the default)"),
        )
        .arg(
            Arg::with_name("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("3110400")
                .help("Size of one frame, in bytes"),
        )
        .arg(
            Arg::with_name("interval")
                .long("interval")
                .takes_value(true)
                .default_value("33")
                .help("Frame interval, in milliseconds"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .default_value("video")
                .help("Capture mode (image, video or preview)"),
        )
        .get_matches();

    let use_isp = matches.is_present("isp");
    let stop_after = match clap::value_t!(matches.value_of("num_frames"), usize) {
        Ok(v) => Some(v),
        Err(e) if e.kind == clap::ErrorKind::ArgumentNotFound => None,
        Err(e) => panic!("Invalid value for stop_after: {}", e),
    };
    let num_buffers: u32 = matches
        .value_of("num_buffers")
        .unwrap_or("0")
        .parse()
        .expect("Invalid number of buffers");
    let frame_size: usize = matches
        .value_of("frame_size")
        .unwrap_or("3110400")
        .parse()
        .expect("Invalid frame size");
    let interval = Duration::from_millis(
        matches
            .value_of("interval")
            .unwrap_or("33")
            .parse()
            .expect("Invalid frame interval"),
    );
    let mode = match matches.value_of("mode") {
        Some("image") => CaptureMode::SingleImage,
        Some("video") => CaptureMode::ContinuousVideo,
        Some("preview") => CaptureMode::Preview,
        _ => panic!("Invalid value for mode"),
    };

    let num_buffers =
        negotiate_buffer_count(num_buffers, frame_size, mode).expect("Invalid buffer request");
    println!(
        "Capturing in {} mode with {} buffers of {} bytes",
        mode, num_buffers, frame_size
    );

    let csi = Arc::new(SimCsi::new());
    let isp = Arc::new(SimIsp::new());
    let sensor = Arc::new(SimSensor::new());
    let allocator = Arc::new(HeapAllocator::default());
    let (done_tx, done_rx) = mpsc::channel();

    let mut ports = DevicePorts::new(csi.clone(), Arc::new(ChannelSink(done_tx)))
        .with_allocator(allocator.clone());
    if use_isp {
        ports = ports
            .with_isp(isp.clone())
            .with_isp3a(Isp3aPorts::new(sensor.clone(), toy_3a).with_actuator(sensor.clone()));
    }
    let config = DeviceConfig::new().isp(use_isp).bayer_raw(use_isp);
    let device = Arc::new(Device::new(config, ports).expect("Failed to create device"));

    device.open().expect("Failed to open device");
    device
        .set_capture_mode(mode)
        .expect("Failed to set capture mode");

    // Frame memory is never touched by the simulated hardware; only its
    // device address matters.
    let frames: Vec<_> = (0..num_buffers)
        .map(|_| {
            allocator
                .allocate(frame_size)
                .expect("Failed to allocate frame")
        })
        .collect();
    for (index, frame) in frames.iter().enumerate() {
        device
            .queue_buffer(0, VideoBuffer::new(index as u32, frame.dma))
            .expect("Failed to queue buffer");
    }
    device.stream_on(0).expect("Failed to start streaming");

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let irq_thread = {
        let device = Arc::clone(&device);
        let csi = Arc::clone(&csi);
        let lets_quit = Arc::clone(&lets_quit);
        thread::Builder::new()
            .name("sim-irq".into())
            .spawn(move || {
                while !lets_quit.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if use_isp {
                        csi.raise(0, CsiIrq::VSYNC_TRIG);
                        device.handle_interrupt();
                    }
                    let done = match mode {
                        CaptureMode::SingleImage => CsiIrq::CAPTURE_DONE,
                        _ => CsiIrq::FRAME_DONE,
                    };
                    csi.raise(0, done);
                    let outcome = device.handle_interrupt();
                    log::trace!("Interrupt outcome: {:?}", outcome);
                }
            })
            .expect("Failed to spawn interrupt thread")
    };

    let mut captured = 0usize;
    while !lets_quit.load(Ordering::SeqCst) {
        let completed = match done_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(completed) => completed,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("No frame completed in the last 500ms");
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let buffer = &completed.buffer;
        println!(
            "Frame {}: buffer {} ({}) at {:?}",
            buffer.sequence, buffer.index, completed.status, buffer.timestamp
        );
        if completed.status == BufferStatus::Done {
            captured += 1;
        }
        if mode == CaptureMode::SingleImage || stop_after.map_or(false, |n| captured >= n) {
            break;
        }

        device
            .queue_buffer(0, VideoBuffer::new(buffer.index, buffer.dma_addr))
            .expect("Failed to queue buffer");
    }

    lets_quit.store(true, Ordering::SeqCst);
    irq_thread.join().expect("Interrupt thread panicked");

    device.stream_off(0).expect("Failed to stop streaming");
    if let Some(counts) = device.stat_counts() {
        println!(
            "Statistics buffers: {} idle, {} active, {} locked",
            counts.idle, counts.active, counts.locked
        );
    }
    if let Some(result) = device.isp_result() {
        println!(
            "Last 3A result: exposure {} lines, gain {}",
            result.exp_line_num, result.exp_analog_gain
        );
    }
    device.close().expect("Failed to close device");

    println!("{} frames captured", captured);
}
