//! In-process stand-ins for the hardware, the sensor, the 3A algorithm and
//! the buffer consumer.
//!
//! Every object records what is done to it, so tests can check which
//! addresses were programmed, which interrupts are enabled or which sensor
//! commands were issued. Interrupt status is raised by hand with `raise`,
//! after which `Device::handle_interrupt` can be called as an interrupt
//! controller would.
use std::sync::{Arc, Condvar, Mutex};

use nix::errno::Errno;

use crate::device::{BufferSink, CompletedBuffer};
use crate::hw::{CsiEngine, CsiIrq, IspEngine, IspIrq};
use crate::isp::{
    Algorithm3a, IspTable, IspTables, Isp3aResult, LensActuator, SensorControl, SensorError,
    StatSections,
};
use crate::memory::DmaAddr;
use crate::{BufferStatus, CaptureMode, MAX_CHANNELS};

#[derive(Default)]
struct CsiState {
    status: [CsiIrq; MAX_CHANNELS],
    enabled: [CsiIrq; MAX_CHANNELS],
    output: [Vec<DmaAddr>; MAX_CHANNELS],
    enable_int_calls: usize,
    resets: usize,
    powered: bool,
    streaming: bool,
}

/// Simulated CSI receiver.
#[derive(Default)]
pub struct SimCsi {
    state: Mutex<CsiState>,
}

impl SimCsi {
    pub fn new() -> Self {
        Default::default()
    }

    /// Assert `irq` in the status register of `channel`.
    pub fn raise(&self, channel: usize, irq: CsiIrq) {
        self.state.lock().unwrap().status[channel] |= irq;
    }

    pub fn status(&self, channel: usize) -> CsiIrq {
        self.state.lock().unwrap().status[channel]
    }

    pub fn enabled_int(&self, channel: usize) -> CsiIrq {
        self.state.lock().unwrap().enabled[channel]
    }

    /// Number of times interrupts were (re-)enabled on any channel.
    pub fn enable_int_calls(&self) -> usize {
        self.state.lock().unwrap().enable_int_calls
    }

    /// All the addresses programmed for `channel`, oldest first.
    pub fn output_addrs(&self, channel: usize) -> Vec<DmaAddr> {
        self.state.lock().unwrap().output[channel].clone()
    }

    pub fn last_output_addr(&self, channel: usize) -> Option<DmaAddr> {
        self.state.lock().unwrap().output[channel].last().copied()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().powered
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().streaming
    }
}

impl CsiEngine for SimCsi {
    fn int_status(&self, channel: usize) -> CsiIrq {
        self.status(channel)
    }

    fn clear_int_status(&self, channel: usize, irq: CsiIrq) {
        self.state.lock().unwrap().status[channel].remove(irq);
    }

    fn enable_int(&self, channel: usize, irq: CsiIrq) {
        let mut state = self.state.lock().unwrap();
        state.enabled[channel] |= irq;
        state.enable_int_calls += 1;
    }

    fn disable_int(&self, channel: usize, irq: CsiIrq) {
        self.state.lock().unwrap().enabled[channel].remove(irq);
    }

    fn set_output_addr(&self, channel: usize, addr: DmaAddr) {
        self.state.lock().unwrap().output[channel].push(addr);
    }

    fn reset(&self) {
        self.state.lock().unwrap().resets += 1;
    }

    fn enable(&self) {
        self.state.lock().unwrap().powered = true;
    }

    fn disable(&self) {
        self.state.lock().unwrap().powered = false;
    }

    fn set_streaming(&self, on: bool) {
        self.state.lock().unwrap().streaming = on;
    }
}

#[derive(Default)]
struct IspState {
    status: IspIrq,
    enabled: IspIrq,
    output: [Vec<DmaAddr>; MAX_CHANNELS],
    statistics: Vec<DmaAddr>,
    para_ready: Vec<bool>,
    tables: Vec<(IspTable, DmaAddr)>,
    powered: bool,
    capture: Option<CaptureMode>,
}

/// Simulated ISP.
#[derive(Default)]
pub struct SimIsp {
    state: Mutex<IspState>,
}

impl SimIsp {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn raise(&self, irq: IspIrq) {
        self.state.lock().unwrap().status |= irq;
    }

    pub fn enabled_irq(&self) -> IspIrq {
        self.state.lock().unwrap().enabled
    }

    pub fn output_addrs(&self, channel: usize) -> Vec<DmaAddr> {
        self.state.lock().unwrap().output[channel].clone()
    }

    /// All the statistics addresses programmed, oldest first.
    pub fn statistics_addrs(&self) -> Vec<DmaAddr> {
        self.state.lock().unwrap().statistics.clone()
    }

    /// Every value written to the parameters-ready flag, oldest first.
    pub fn para_ready_writes(&self) -> Vec<bool> {
        self.state.lock().unwrap().para_ready.clone()
    }

    pub fn loaded_tables(&self) -> Vec<(IspTable, DmaAddr)> {
        self.state.lock().unwrap().tables.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().powered
    }

    pub fn capture(&self) -> Option<CaptureMode> {
        self.state.lock().unwrap().capture
    }
}

impl IspEngine for SimIsp {
    fn irq_status(&self) -> IspIrq {
        self.state.lock().unwrap().status
    }

    fn clear_irq_status(&self, irq: IspIrq) {
        self.state.lock().unwrap().status.remove(irq);
    }

    fn enable_irq(&self, irq: IspIrq) {
        self.state.lock().unwrap().enabled |= irq;
    }

    fn disable_irq(&self, irq: IspIrq) {
        self.state.lock().unwrap().enabled.remove(irq);
    }

    fn set_output_addr(&self, channel: usize, addr: DmaAddr) {
        self.state.lock().unwrap().output[channel].push(addr);
    }

    fn set_statistics_addr(&self, addr: DmaAddr) {
        self.state.lock().unwrap().statistics.push(addr);
    }

    fn set_para_ready(&self, ready: bool) {
        self.state.lock().unwrap().para_ready.push(ready);
    }

    fn load_tables(&self, tables: &IspTables) {
        let mut state = self.state.lock().unwrap();
        state.tables = IspTable::ALL
            .iter()
            .filter_map(|t| tables.region(*t).map(|r| (*t, r.dma)))
            .collect();
    }

    fn enable(&self) {
        self.state.lock().unwrap().powered = true;
    }

    fn disable(&self) {
        self.state.lock().unwrap().powered = false;
    }

    fn start_capture(&self, mode: CaptureMode) {
        self.state.lock().unwrap().capture = Some(mode);
    }

    fn stop_capture(&self) {
        self.state.lock().unwrap().capture = None;
    }
}

#[derive(Default)]
struct SensorState {
    exposures: Vec<i32>,
    gains: Vec<i32>,
    combined: Vec<(i32, i32)>,
    lens: Vec<i32>,
    fail_combined: bool,
    fail_lens: bool,
}

/// Simulated sensor with a lens actuator.
#[derive(Default)]
pub struct SimSensor {
    state: Mutex<SensorState>,
}

impl SimSensor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Make the combined exposure and gain command fail.
    pub fn fail_combined(&self, fail: bool) {
        self.state.lock().unwrap().fail_combined = fail;
    }

    pub fn fail_lens(&self, fail: bool) {
        self.state.lock().unwrap().fail_lens = fail;
    }

    pub fn exposures(&self) -> Vec<i32> {
        self.state.lock().unwrap().exposures.clone()
    }

    pub fn gains(&self) -> Vec<i32> {
        self.state.lock().unwrap().gains.clone()
    }

    pub fn combined(&self) -> Vec<(i32, i32)> {
        self.state.lock().unwrap().combined.clone()
    }

    pub fn lens_positions(&self) -> Vec<i32> {
        self.state.lock().unwrap().lens.clone()
    }
}

impl SensorControl for SimSensor {
    fn set_exposure(&self, lines: i32) -> Result<(), SensorError> {
        self.state.lock().unwrap().exposures.push(lines);
        Ok(())
    }

    fn set_gain(&self, gain: i32) -> Result<(), SensorError> {
        self.state.lock().unwrap().gains.push(gain);
        Ok(())
    }

    fn set_exposure_and_gain(&self, lines: i32, gain: i32) -> Result<(), SensorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_combined {
            return Err(SensorError::Failed(Errno::EIO));
        }
        state.combined.push((lines, gain));
        Ok(())
    }
}

impl LensActuator for SimSensor {
    fn set_position(&self, code: i32) -> Result<(), SensorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_lens {
            return Err(SensorError::Failed(Errno::EIO));
        }
        state.lens.push(code);
        Ok(())
    }
}

/// Buffer consumer recording every returned buffer.
#[derive(Default)]
pub struct RecordingSink {
    done: Mutex<Vec<CompletedBuffer>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn completed(&self) -> Vec<CompletedBuffer> {
        self.done.lock().unwrap().clone()
    }

    /// Indices of the buffers returned with `status`, in order of return.
    pub fn indices(&self, status: BufferStatus) -> Vec<u32> {
        self.done
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.buffer.index)
            .collect()
    }
}

impl BufferSink for RecordingSink {
    fn buffer_done(&self, buffer: CompletedBuffer) {
        self.done.lock().unwrap().push(buffer);
    }
}

#[derive(Default)]
struct AlgorithmState {
    result: Isp3aResult,
    /// First histogram byte of every statistics buffer seen.
    seen: Vec<u8>,
    started: usize,
    held: bool,
}

/// 3A algorithm returning a fixed result.
///
/// It can be held, in which case calls block until `resume` is called. This
/// lets tests keep a statistics buffer locked for as long as they need.
#[derive(Clone, Default)]
pub struct FixedAlgorithm {
    state: Arc<(Mutex<AlgorithmState>, Condvar)>,
}

impl FixedAlgorithm {
    pub fn new(result: Isp3aResult) -> Self {
        let algorithm = Self::default();
        algorithm.set_result(result);
        algorithm
    }

    pub fn set_result(&self, result: Isp3aResult) {
        self.state.0.lock().unwrap().result = result;
    }

    /// Make subsequent calls block until `resume` is called.
    pub fn hold(&self) {
        self.state.0.lock().unwrap().held = true;
    }

    pub fn resume(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().held = false;
        cvar.notify_all();
    }

    /// Wait until at least `count` calls have started.
    pub fn wait_for_calls(&self, count: usize) {
        let (lock, cvar) = &*self.state;
        let _state = cvar
            .wait_while(lock.lock().unwrap(), |s| s.started < count)
            .unwrap();
    }

    pub fn calls(&self) -> usize {
        self.state.0.lock().unwrap().started
    }

    pub fn seen(&self) -> Vec<u8> {
        self.state.0.lock().unwrap().seen.clone()
    }

    /// The callback to hand over to the device.
    pub fn callback(&self) -> impl Algorithm3a {
        let state = Arc::clone(&self.state);
        move |sections: &StatSections<'_>, _prev: &Isp3aResult| -> anyhow::Result<Isp3aResult> {
            let (lock, cvar) = &*state;
            let mut s = lock.lock().unwrap();
            s.started += 1;
            s.seen.push(sections.hist.first().copied().unwrap_or_default());
            cvar.notify_all();
            let s = cvar.wait_while(s, |s| s.held).unwrap();
            Ok(s.result.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_csi_status() {
        let csi = SimCsi::new();
        csi.raise(1, CsiIrq::FRAME_DONE | CsiIrq::VSYNC_TRIG);
        assert_eq!(csi.int_status(0), CsiIrq::empty());
        csi.clear_int_status(1, CsiIrq::VSYNC_TRIG);
        assert_eq!(csi.int_status(1), CsiIrq::FRAME_DONE);

        csi.enable_int(1, CsiIrq::FRAME_DONE | CsiIrq::CAPTURE_DONE);
        csi.disable_int(1, CsiIrq::CAPTURE_DONE);
        assert_eq!(csi.enabled_int(1), CsiIrq::FRAME_DONE);
        assert_eq!(csi.enable_int_calls(), 1);
    }

    #[test]
    fn test_fixed_algorithm_hold() {
        let algorithm = FixedAlgorithm::new(Isp3aResult {
            exp_line_num: 10,
            ..Default::default()
        });
        algorithm.hold();

        let mut callback: crate::isp::BoxedAlgorithm = Box::new(algorithm.callback());
        let handle = std::thread::spawn(move || {
            let buf = [7u8; 0x3c00];
            let sections = crate::isp::StatLayout::default().split(&buf).unwrap();
            callback(&sections, &Isp3aResult::default()).unwrap()
        });

        algorithm.wait_for_calls(1);
        assert_eq!(algorithm.seen(), vec![7]);
        algorithm.resume();
        assert_eq!(handle.join().unwrap().exp_line_num, 10);
    }
}
