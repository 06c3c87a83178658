//! C FFI of the vfer crate.
//!
//! Devices are created with [`vfer_device_create`] and are then addressed by
//! the id they were created with, until being given to
//! [`vfer_device_destroy`]. Devices created this way keep their completed
//! buffers for pickup: the client dequeues them with
//! [`vfer_dqbuffer_special`], optionally after being told about them by the
//! callback registered with [`vfer_register_buffer_done_callback`].
//!
//! The capture hardware is reached through the register callbacks of
//! [`vfer_csi_ops`]. The client must call [`vfer_handle_irq`] from its
//! interrupt handler.
//!
//! Functions returning a `c_int` return 0 on success, or a negative errno
//! value.
#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_uint, c_void};
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use vfer::device::{
    BufferSink, CloseError, CompletedBuffer, DequeueError, Device, DeviceConfig, DevicePorts,
    DoneMode, OpenError, StreamOnError, VideoBuffer,
};
use vfer::hw::{CsiEngine, CsiIrq};
use vfer::memory::DmaAddr;
use vfer::registry::{DeviceRegistry, RegistryError};
use vfer::BufferStatus;

static INIT: Once = Once::new();
static REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();

fn registry() -> &'static DeviceRegistry {
    REGISTRY.get_or_init(DeviceRegistry::new)
}

fn errno(e: Errno) -> c_int {
    -(e as c_int)
}

/// Initialize the vfer library. This only sets up the proper hooks for
/// logging, so although it is not a hard requirement to call this function,
/// failure to do so will result in no logs being printed.
#[no_mangle]
pub extern "C" fn vfer_init() {
    INIT.call_once(|| {
        #[cfg(feature = "env_logger")]
        env_logger::builder().format_timestamp(None).init();

        #[cfg(feature = "android")]
        android_logger::init_once(
            android_logger::Config::default().with_min_level(log::Level::Trace),
        );
    });
}

/// Register accessors of a CSI receiver.
///
/// Every callback receives `data` as its first argument. They are called
/// from [`vfer_handle_irq`] as well as from the stream control functions,
/// and must not block.
#[repr(C)]
pub struct vfer_csi_ops {
    pub int_status: extern "C" fn(data: *mut c_void, channel: c_uint) -> u32,
    pub clear_int_status: extern "C" fn(data: *mut c_void, channel: c_uint, irq: u32),
    pub enable_int: extern "C" fn(data: *mut c_void, channel: c_uint, irq: u32),
    pub disable_int: extern "C" fn(data: *mut c_void, channel: c_uint, irq: u32),
    pub set_output_addr: extern "C" fn(data: *mut c_void, channel: c_uint, addr: u64),
    pub reset: extern "C" fn(data: *mut c_void),
    pub enable: extern "C" fn(data: *mut c_void),
    pub disable: extern "C" fn(data: *mut c_void),
    pub set_streaming: extern "C" fn(data: *mut c_void, on: bool),
    pub data: *mut c_void,
}

// The client guarantees its callbacks can be called from any thread.
struct FfiCsi(vfer_csi_ops);
unsafe impl Send for FfiCsi {}
unsafe impl Sync for FfiCsi {}

impl CsiEngine for FfiCsi {
    fn int_status(&self, channel: usize) -> CsiIrq {
        CsiIrq::from_bits_truncate((self.0.int_status)(self.0.data, channel as c_uint))
    }

    fn clear_int_status(&self, channel: usize, irq: CsiIrq) {
        (self.0.clear_int_status)(self.0.data, channel as c_uint, irq.bits())
    }

    fn enable_int(&self, channel: usize, irq: CsiIrq) {
        (self.0.enable_int)(self.0.data, channel as c_uint, irq.bits())
    }

    fn disable_int(&self, channel: usize, irq: CsiIrq) {
        (self.0.disable_int)(self.0.data, channel as c_uint, irq.bits())
    }

    fn set_output_addr(&self, channel: usize, addr: DmaAddr) {
        (self.0.set_output_addr)(self.0.data, channel as c_uint, addr.0)
    }

    fn reset(&self) {
        (self.0.reset)(self.0.data)
    }

    fn enable(&self) {
        (self.0.enable)(self.0.data)
    }

    fn disable(&self) {
        (self.0.disable)(self.0.data)
    }

    fn set_streaming(&self, on: bool) {
        (self.0.set_streaming)(self.0.data, on)
    }
}

/// Buffers only reach the sink when a device is closed with buffers still
/// queued. The client considers them returned once the close has succeeded.
struct ClosedBufferSink {
    id: u32,
}

impl BufferSink for ClosedBufferSink {
    fn buffer_done(&self, buffer: CompletedBuffer) {
        debug!(
            "Device {}: buffer {} returned at close",
            self.id, buffer.buffer.index
        );
    }
}

/// A completed buffer, as returned by [`vfer_dqbuffer_special`].
#[repr(C)]
#[derive(Default)]
pub struct vfer_buffer {
    pub index: u32,
    pub dma_addr: u64,
    /// Completion time on the monotonic clock, in nanoseconds.
    pub timestamp_ns: u64,
    pub sequence: u32,
    /// Set if the buffer was canceled and contains no frame.
    pub error: bool,
}

impl From<CompletedBuffer> for vfer_buffer {
    fn from(completed: CompletedBuffer) -> Self {
        let buffer = completed.buffer;
        Self {
            index: buffer.index,
            dma_addr: buffer.dma_addr.0,
            timestamp_ns: buffer
                .timestamp
                .unwrap_or(Duration::ZERO)
                .as_nanos() as u64,
            sequence: buffer.sequence,
            error: completed.status == BufferStatus::Error,
        }
    }
}

/// Callback invoked when completed buffers are ready to be dequeued from
/// `channel`. It is called from [`vfer_handle_irq`] or
/// [`vfer_streamoff_special`], after the device lock has been released, so it
/// may call [`vfer_dqbuffer_special`] right away.
pub type vfer_buffer_done_cb = extern "C" fn(data: *mut c_void, channel: c_uint);

// A void pointer that can be sent across threads.
#[derive(Clone, Copy)]
struct SendablePtr(*mut c_void);
unsafe impl Send for SendablePtr {}
unsafe impl Sync for SendablePtr {}

fn lookup(id: u32) -> Result<Arc<Device>, c_int> {
    registry().get(id).map_err(|e| {
        error!("{}", e);
        errno(Errno::ENODEV)
    })
}

/// Create device `id` with `num_channels` channels, driving the CSI receiver
/// through `ops`.
///
/// Returns `-EBUSY` if a device is already registered with `id`, `-EINVAL`
/// if `num_channels` is invalid.
///
/// # Safety
///
/// `ops` must be a valid pointer to a `vfer_csi_ops` whose callbacks remain
/// callable until [`vfer_device_destroy`] returns for this device.
#[no_mangle]
pub unsafe extern "C" fn vfer_device_create(
    id: u32,
    num_channels: c_uint,
    ops: *const vfer_csi_ops,
) -> c_int {
    assert!(!ops.is_null());
    let ops = std::ptr::read(ops);

    let config = DeviceConfig::new()
        .num_channels(num_channels as usize)
        .done_mode(DoneMode::Pickup);
    let ports = DevicePorts::new(Arc::new(FfiCsi(ops)), Arc::new(ClosedBufferSink { id }));

    let device = match Device::new(config, ports) {
        Ok(device) => device,
        Err(e) => {
            error!("Cannot create device {}: {}", id, e);
            return errno(Errno::EINVAL);
        }
    };

    match registry().register(id, device) {
        Ok(_) => {
            info!("Device {}: created with {} channels", id, num_channels);
            0
        }
        Err(e @ RegistryError::AlreadyRegistered(_)) => {
            error!("{}", e);
            errno(Errno::EBUSY)
        }
        Err(e) => {
            error!("{}", e);
            errno(Errno::EINVAL)
        }
    }
}

/// Stop and destroy device `id`. Its channels are streamed off and the
/// device is closed if needed.
///
/// It is guaranteed that the register callbacks will not be called after
/// this function has returned, unless another thread is still in a call
/// involving this device.
#[no_mangle]
pub extern "C" fn vfer_device_destroy(id: u32) -> c_int {
    info!("Device {}: destroying", id);

    let device = match registry().unregister(id) {
        Ok(device) => device,
        Err(e) => {
            warn!("{}", e);
            return errno(Errno::ENODEV);
        }
    };

    if device.status().opened {
        for channel in 0..device.config().channels() {
            if let Err(e) = device.stream_off(channel) {
                error!("Device {}: error while streaming off: {}", id, e);
            }
        }
        if let Err(e) = device.close() {
            error!("Device {}: error while closing: {}", id, e);
        }
    }

    0
}

/// Open device `id`. Returns `-EBUSY` if it is already opened.
#[no_mangle]
pub extern "C" fn vfer_open_special(id: u32) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.open() {
        Ok(()) => 0,
        Err(OpenError::Busy) => errno(Errno::EBUSY),
        Err(e) => {
            error!("Device {}: cannot open: {}", id, e);
            errno(Errno::ENOMEM)
        }
    }
}

/// Close device `id`. All its channels must have been streamed off.
#[no_mangle]
pub extern "C" fn vfer_close_special(id: u32) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.close() {
        Ok(()) => 0,
        Err(e @ CloseError::StillGenerating) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EBUSY)
        }
        Err(CloseError::NotOpen) => errno(Errno::EINVAL),
    }
}

/// Start capturing on `channel`. At least one buffer must have been queued
/// with [`vfer_qbuffer_special`].
#[no_mangle]
pub extern "C" fn vfer_streamon_special(id: u32, channel: c_uint) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.stream_on(channel as usize) {
        Ok(()) => 0,
        Err(e @ StreamOnError::NoBuffers(_)) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EAGAIN)
        }
        Err(e) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EINVAL)
        }
    }
}

/// Stop capturing on `channel`. Buffers still queued become available to
/// [`vfer_dqbuffer_special`] with their `error` flag set.
#[no_mangle]
pub extern "C" fn vfer_streamoff_special(id: u32, channel: c_uint) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.stream_off(channel as usize) {
        Ok(()) => 0,
        Err(e) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EINVAL)
        }
    }
}

/// Queue buffer `index`, located at device address `dma_addr`, on `channel`.
#[no_mangle]
pub extern "C" fn vfer_qbuffer_special(
    id: u32,
    channel: c_uint,
    index: u32,
    dma_addr: u64,
) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.queue_buffer(channel as usize, VideoBuffer::new(index, DmaAddr(dma_addr))) {
        Ok(()) => 0,
        Err(e) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EINVAL)
        }
    }
}

/// Dequeue the oldest completed buffer of `channel` into `buffer`.
///
/// Returns `-EAGAIN` if no buffer has completed.
///
/// # Safety
///
/// `buffer` must point to valid memory that can receive a `vfer_buffer`.
#[no_mangle]
pub unsafe extern "C" fn vfer_dqbuffer_special(
    id: u32,
    channel: c_uint,
    buffer: *mut vfer_buffer,
) -> c_int {
    assert!(!buffer.is_null());
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    match device.dequeue_done(channel as usize) {
        Ok(completed) => {
            *buffer = completed.into();
            0
        }
        Err(DequeueError::NotReady) => errno(Errno::EAGAIN),
        Err(e) => {
            error!("Device {}: {}", id, e);
            errno(Errno::EINVAL)
        }
    }
}

/// Register `cb` to be called with `data` whenever buffers can be dequeued
/// from device `id`. Replaces any previously registered callback.
#[no_mangle]
pub extern "C" fn vfer_register_buffer_done_callback(
    id: u32,
    cb: vfer_buffer_done_cb,
    data: *mut c_void,
) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    let data = SendablePtr(data);
    device.set_done_notifier(move |channel: usize| {
        let data = data;
        cb(data.0, channel as c_uint)
    });

    0
}

/// Service an interrupt of device `id`. To be called from the client's
/// interrupt handler.
#[no_mangle]
pub extern "C" fn vfer_handle_irq(id: u32) -> c_int {
    let device = match lookup(id) {
        Ok(device) => device,
        Err(e) => return e,
    };

    let outcome = device.handle_interrupt();
    trace!("Device {}: {:?}", id, outcome);

    0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use vfer::hw::sim::SimCsi;

    use super::*;

    fn sim(data: *mut c_void) -> &'static SimCsi {
        unsafe { &*(data as *const SimCsi) }
    }

    extern "C" fn int_status(data: *mut c_void, channel: c_uint) -> u32 {
        sim(data).int_status(channel as usize).bits()
    }
    extern "C" fn clear_int_status(data: *mut c_void, channel: c_uint, irq: u32) {
        sim(data).clear_int_status(channel as usize, CsiIrq::from_bits_truncate(irq))
    }
    extern "C" fn enable_int(data: *mut c_void, channel: c_uint, irq: u32) {
        sim(data).enable_int(channel as usize, CsiIrq::from_bits_truncate(irq))
    }
    extern "C" fn disable_int(data: *mut c_void, channel: c_uint, irq: u32) {
        sim(data).disable_int(channel as usize, CsiIrq::from_bits_truncate(irq))
    }
    extern "C" fn set_output_addr(data: *mut c_void, channel: c_uint, addr: u64) {
        sim(data).set_output_addr(channel as usize, DmaAddr(addr))
    }
    extern "C" fn reset(data: *mut c_void) {
        CsiEngine::reset(sim(data))
    }
    extern "C" fn enable(data: *mut c_void) {
        CsiEngine::enable(sim(data))
    }
    extern "C" fn disable(data: *mut c_void) {
        CsiEngine::disable(sim(data))
    }
    extern "C" fn set_streaming(data: *mut c_void, on: bool) {
        sim(data).set_streaming(on)
    }

    static NOTIFIED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn buffer_done(_data: *mut c_void, channel: c_uint) {
        assert_eq!(channel, 0);
        NOTIFIED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_special_api() {
        vfer_init();
        // Leaked so the callbacks can use it for the remainder of the test.
        let csi: &'static SimCsi = Box::leak(Box::new(SimCsi::new()));
        let ops = vfer_csi_ops {
            int_status,
            clear_int_status,
            enable_int,
            disable_int,
            set_output_addr,
            reset,
            enable,
            disable,
            set_streaming,
            data: csi as *const SimCsi as *mut c_void,
        };

        const ID: u32 = 42;
        assert_eq!(unsafe { vfer_device_create(ID, 1, &ops) }, 0);
        assert_eq!(
            unsafe { vfer_device_create(ID, 1, &ops) },
            errno(Errno::EBUSY)
        );
        assert_eq!(vfer_open_special(7), errno(Errno::ENODEV));

        assert_eq!(vfer_open_special(ID), 0);
        assert_eq!(vfer_open_special(ID), errno(Errno::EBUSY));
        assert_eq!(
            vfer_register_buffer_done_callback(ID, buffer_done, std::ptr::null_mut()),
            0
        );
        for i in 0..4 {
            assert_eq!(vfer_qbuffer_special(ID, 0, i, 0x1000_0000 + 0x1000 * i as u64), 0);
        }
        assert_eq!(vfer_streamon_special(ID, 0), 0);
        assert!(csi.is_streaming());

        let mut buffer = vfer_buffer::default();
        assert_eq!(
            unsafe { vfer_dqbuffer_special(ID, 0, &mut buffer) },
            errno(Errno::EAGAIN)
        );

        for _ in 0..3 {
            csi.raise(0, CsiIrq::FRAME_DONE);
            assert_eq!(vfer_handle_irq(ID), 0);
        }
        assert_eq!(NOTIFIED.load(Ordering::SeqCst), 1);
        assert_eq!(unsafe { vfer_dqbuffer_special(ID, 0, &mut buffer) }, 0);
        assert_eq!((buffer.index, buffer.error), (0, false));
        assert!(buffer.timestamp_ns > 0);

        assert_eq!(vfer_close_special(ID), errno(Errno::EBUSY));
        assert_eq!(vfer_streamoff_special(ID, 0), 0);
        assert!(!csi.is_streaming());
        assert_eq!(unsafe { vfer_dqbuffer_special(ID, 0, &mut buffer) }, 0);
        assert_eq!((buffer.index, buffer.error), (1, true));

        assert_eq!(vfer_close_special(ID), 0);
        assert_eq!(vfer_device_destroy(ID), 0);
        assert_eq!(vfer_device_destroy(ID), errno(Errno::ENODEV));
    }
}
