//! 3A processing state and the ports it drives.
//!
//! The statistics engine of the ISP writes one `StatLayout`-shaped block per
//! frame. Once such a block is locked by the interrupt path, the deferred 3A
//! task hands its sections to an external `Algorithm3a` and applies the
//! result: lens position right away, exposure and gain on the next vsync
//! through the sensor-update task.
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use nix::errno::Errno;
use thiserror::Error;

use crate::memory::{AllocError, DmaAllocator, DmaArena, RegionHandle};

/// Offsets of the sections of a statistics buffer, in bytes.
///
/// Sections are laid out in the order of the fields, each one ending where
/// the next one starts. The last one ends at `size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatLayout {
    pub hist: usize,
    pub ae: usize,
    pub awb: usize,
    pub af: usize,
    pub afs: usize,
    pub awb_win: usize,
    pub size: usize,
}

impl Default for StatLayout {
    fn default() -> Self {
        Self {
            hist: 0x0000,
            ae: 0x0400,
            awb: 0x1400,
            af: 0x2400,
            afs: 0x2a00,
            awb_win: 0x2c00,
            size: 0x3c00,
        }
    }
}

/// Sections of one statistics buffer.
#[derive(Debug)]
pub struct StatSections<'a> {
    pub hist: &'a [u8],
    pub ae: &'a [u8],
    pub awb: &'a [u8],
    pub af: &'a [u8],
    pub afs: &'a [u8],
    pub awb_win: &'a [u8],
}

impl StatLayout {
    fn offsets(&self) -> [usize; 7] {
        [
            self.hist,
            self.ae,
            self.awb,
            self.af,
            self.afs,
            self.awb_win,
            self.size,
        ]
    }

    /// Returns whether the sections are in order and fit in `size`.
    pub fn is_valid(&self) -> bool {
        self.size > 0 && self.offsets().windows(2).all(|w| w[0] <= w[1])
    }

    /// Split a statistics buffer into its sections. Returns `None` if the
    /// layout is invalid or `buf` is shorter than `size`.
    pub fn split<'a>(&self, buf: &'a [u8]) -> Option<StatSections<'a>> {
        if !self.is_valid() || buf.len() < self.size {
            return None;
        }

        let o = self.offsets();
        let section = |i: usize| &buf[o[i]..o[i + 1]];
        Some(StatSections {
            hist: section(0),
            ae: section(1),
            awb: section(2),
            af: section(3),
            afs: section(4),
            awb_win: section(5),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WbGains {
    pub r: u16,
    pub gr: u16,
    pub gb: u16,
    pub b: u16,
}

/// Output of the 3A algorithm, fed back to it on the next frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Isp3aResult {
    /// Exposure time, in sensor lines.
    pub exp_line_num: i32,
    /// Analog gain, where 16 is unity.
    pub exp_analog_gain: i32,
    /// Lens actuator code.
    pub real_vcm_pos: i32,
    pub wb_gains: WbGains,
    pub af_locked: bool,
    /// When set, the lens position is pushed every frame.
    pub test_mode: bool,
    /// When cleared, the lens position is pushed every frame.
    pub af_enabled: bool,
}

impl Default for Isp3aResult {
    fn default() -> Self {
        Self {
            exp_line_num: 0,
            exp_analog_gain: 16,
            real_vcm_pos: 0,
            wb_gains: Default::default(),
            af_locked: false,
            test_mode: false,
            af_enabled: true,
        }
    }
}

/// Last values successfully applied to the sensor and lens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtrlParams {
    pub prev_exp_line: i32,
    pub prev_ana_gain: i32,
    pub prev_focus_pos: i32,
}

impl Default for CtrlParams {
    fn default() -> Self {
        Self {
            prev_exp_line: 16,
            prev_ana_gain: 16,
            prev_focus_pos: 50,
        }
    }
}

impl CtrlParams {
    /// Values the sensor is assumed to be left with once the device is
    /// closed.
    pub(crate) fn on_close(&mut self) {
        self.prev_exp_line = 0;
        self.prev_ana_gain = 1;
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("invalid exposure value {0}")]
    InvalidExposure(i32),
    #[error("invalid analog gain {0}")]
    InvalidGain(i32),
    #[error("command not supported by this sensor")]
    Unsupported,
    #[error("sensor control failed: {0}")]
    Failed(#[from] Errno),
}

/// Exposure controls of the image sensor.
pub trait SensorControl: Send + Sync {
    fn set_exposure(&self, lines: i32) -> Result<(), SensorError>;
    fn set_gain(&self, gain: i32) -> Result<(), SensorError>;
    /// Apply exposure and gain as a single command, so both take effect on
    /// the same frame.
    fn set_exposure_and_gain(&self, _lines: i32, _gain: i32) -> Result<(), SensorError> {
        Err(SensorError::Unsupported)
    }
}

/// Voice-coil lens actuator.
pub trait LensActuator: Send + Sync {
    fn set_position(&self, code: i32) -> Result<(), SensorError>;
}

/// Callback running the 3A algorithms on the statistics of one frame.
///
/// It receives the sections of the statistics buffer and the previous
/// result, and returns the new result. On error the previous result is kept.
pub trait Algorithm3a:
    FnMut(&StatSections<'_>, &Isp3aResult) -> anyhow::Result<Isp3aResult> + Send + 'static
{
}
impl<F> Algorithm3a for F where
    F: FnMut(&StatSections<'_>, &Isp3aResult) -> anyhow::Result<Isp3aResult> + Send + 'static
{
}

pub(crate) type BoxedAlgorithm =
    Box<dyn FnMut(&StatSections<'_>, &Isp3aResult) -> anyhow::Result<Isp3aResult> + Send>;

/// State shared by the 3A task and the sensor-update task. Lives behind the
/// device's 3A lock.
pub(crate) struct Isp3a {
    result: Isp3aResult,
    ctrl: CtrlParams,
    algorithm: BoxedAlgorithm,
    sensor: Arc<dyn SensorControl>,
    actuator: Option<Arc<dyn LensActuator>>,
    combined_exposure: bool,
}

impl Isp3a {
    pub(crate) fn new(
        algorithm: BoxedAlgorithm,
        sensor: Arc<dyn SensorControl>,
        actuator: Option<Arc<dyn LensActuator>>,
        combined_exposure: bool,
    ) -> Self {
        Self {
            result: Default::default(),
            ctrl: Default::default(),
            algorithm,
            sensor,
            actuator,
            combined_exposure,
        }
    }

    pub(crate) fn result(&self) -> &Isp3aResult {
        &self.result
    }

    pub(crate) fn ctrl_params(&self) -> CtrlParams {
        self.ctrl
    }

    pub(crate) fn reset(&mut self) {
        self.result = Default::default();
        self.ctrl = Default::default();
    }

    pub(crate) fn on_close(&mut self) {
        self.ctrl.on_close();
    }

    /// Run the 3A algorithm on `sections` and move the lens if needed.
    pub(crate) fn process_statistics(&mut self, sections: &StatSections<'_>, frame_number: u32) {
        trace!("Running 3A on statistics of frame {}", frame_number);

        match (self.algorithm)(sections, &self.result) {
            Ok(result) => self.result = result,
            Err(e) => {
                warn!("3A algorithm failed on frame {}: {:#}", frame_number, e);
                return;
            }
        }

        let Some(actuator) = &self.actuator else {
            return;
        };
        let pos = self.result.real_vcm_pos;
        if pos != self.ctrl.prev_focus_pos || self.result.test_mode || !self.result.af_enabled {
            match actuator.set_position(pos) {
                Ok(()) => self.ctrl.prev_focus_pos = pos,
                Err(e) => warn!("Cannot set lens position to {}: {}", pos, e),
            }
        }
    }

    fn set_exposure(&mut self, lines: i32) -> Result<(), SensorError> {
        if lines <= 0 {
            return Err(SensorError::InvalidExposure(lines));
        }
        self.sensor.set_exposure(lines)?;
        self.ctrl.prev_exp_line = lines;
        Ok(())
    }

    fn set_gain(&mut self, gain: i32) -> Result<(), SensorError> {
        if gain < 16 {
            return Err(SensorError::InvalidGain(gain));
        }
        self.sensor.set_gain(gain)?;
        self.ctrl.prev_ana_gain = gain;
        Ok(())
    }

    fn set_exposure_and_gain(&mut self, lines: i32, gain: i32) -> Result<(), SensorError> {
        if lines <= 0 {
            return Err(SensorError::InvalidExposure(lines));
        }
        if gain < 16 {
            return Err(SensorError::InvalidGain(gain));
        }
        self.sensor.set_exposure_and_gain(lines, gain)?;
        self.ctrl.prev_exp_line = lines;
        self.ctrl.prev_ana_gain = gain;
        Ok(())
    }

    /// Push the exposure and gain of the latest result to the sensor.
    pub(crate) fn update_sensor_exposure(&mut self) {
        let lines = self.result.exp_line_num;
        let gain = self.result.exp_analog_gain;

        if self.combined_exposure {
            debug!("Combined exposure {} gain {}", lines, gain);
            match self.set_exposure_and_gain(lines, gain) {
                Ok(()) => return,
                Err(e) => warn!("Cannot set exposure and gain together ({}), retrying separately", e),
            }
        } else {
            debug!("Separate exposure {} gain {}", lines, gain);
        }

        if let Err(e) = self.set_exposure(lines) {
            warn!("Cannot set sensor exposure: {}", e);
        }
        if let Err(e) = self.set_gain(gain) {
            warn!("Cannot set sensor gain: {}", e);
        }
    }
}

/// Processing tables of the ISP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum IspTable {
    Lut = 0,
    LensShading = 1,
    Gamma = 2,
    Linear = 3,
    Drc = 4,
    Disc = 5,
}

impl fmt::Display for IspTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl IspTable {
    pub const ALL: [IspTable; 6] = [
        IspTable::Lut,
        IspTable::LensShading,
        IspTable::Gamma,
        IspTable::Linear,
        IspTable::Drc,
        IspTable::Disc,
    ];

    pub const fn size(self) -> usize {
        match self {
            IspTable::Lut => 0x0400,
            IspTable::LensShading => 0x0600,
            IspTable::Gamma => 0x0200,
            IspTable::Linear => 0x0600,
            IspTable::Drc => 0x0200,
            IspTable::Disc => 0x0200,
        }
    }

    /// Which arena the table lives in, and at which index.
    const fn location(self) -> (bool, usize) {
        match self {
            IspTable::Lut => (false, 0),
            IspTable::LensShading => (false, 1),
            IspTable::Gamma => (false, 2),
            IspTable::Linear => (false, 3),
            IspTable::Drc => (true, 0),
            IspTable::Disc => (true, 1),
        }
    }
}

/// DMA memory backing the ISP processing tables.
pub struct IspTables {
    lut_lens_gamma: DmaArena,
    drc_disc: DmaArena,
}

impl IspTables {
    pub fn allocate(allocator: &dyn DmaAllocator) -> Result<Self, AllocError> {
        let lut_lens_gamma = DmaArena::new(
            allocator,
            &[
                IspTable::Lut.size(),
                IspTable::LensShading.size(),
                IspTable::Gamma.size(),
                IspTable::Linear.size(),
            ],
        )?;
        let drc_disc = DmaArena::new(allocator, &[IspTable::Drc.size(), IspTable::Disc.size()])?;

        Ok(Self {
            lut_lens_gamma,
            drc_disc,
        })
    }

    fn arena(&self, table: IspTable) -> (&DmaArena, usize) {
        match table.location() {
            (false, index) => (&self.lut_lens_gamma, index),
            (true, index) => (&self.drc_disc, index),
        }
    }

    pub fn region(&self, table: IspTable) -> Option<RegionHandle> {
        let (arena, index) = self.arena(table);
        arena.region(index)
    }

    /// Fill `table` through its CPU mapping.
    pub fn write<R, F: FnOnce(&mut [u8]) -> R>(&self, table: IspTable, f: F) -> Option<R> {
        let (arena, index) = self.arena(table);
        arena.write(index, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::hw::sim::SimSensor;
    use crate::memory::HeapAllocator;

    fn isp3a_with(sensor: &Arc<SimSensor>, combined: bool, result: Isp3aResult) -> Isp3a {
        let algorithm: BoxedAlgorithm =
            Box::new(move |_: &StatSections<'_>, _: &Isp3aResult| Ok(result.clone()));
        let sensor_port: Arc<dyn SensorControl> = sensor.clone();
        let actuator: Arc<dyn LensActuator> = sensor.clone();
        Isp3a::new(algorithm, sensor_port, Some(actuator), combined)
    }

    fn run_once(isp3a: &mut Isp3a) {
        let layout = StatLayout::default();
        let buf = vec![0u8; layout.size];
        let sections = layout.split(&buf).unwrap();
        isp3a.process_statistics(&sections, 0);
    }

    #[test]
    fn test_stat_layout_split() {
        let layout = StatLayout::default();
        assert!(layout.is_valid());

        let buf: Vec<u8> = (0..layout.size).map(|i| (i >> 8) as u8).collect();
        let sections = layout.split(&buf).unwrap();
        assert_eq!(sections.hist.len(), 0x400);
        assert_eq!(sections.ae.len(), 0x1000);
        assert_eq!(sections.ae[0], 0x04);
        assert_eq!(sections.awb[0], 0x14);
        assert_eq!(sections.af.len(), 0x600);
        assert_eq!(sections.afs[0], 0x2a);
        assert_eq!(sections.awb_win.len(), 0x1000);

        assert!(layout.split(&buf[..layout.size - 1]).is_none());
    }

    #[test]
    fn test_stat_layout_invalid() {
        let layout = StatLayout {
            af: 0x3000,
            ..Default::default()
        };
        assert!(!layout.is_valid());
        assert!(layout.split(&[0u8; 0x4000]).is_none());
    }

    #[test]
    fn test_lens_moves_only_when_position_changes() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(
            &sensor,
            false,
            Isp3aResult {
                real_vcm_pos: 120,
                ..Default::default()
            },
        );

        run_once(&mut isp3a);
        run_once(&mut isp3a);
        assert_eq!(sensor.lens_positions(), vec![120]);
        assert_eq!(isp3a.ctrl_params().prev_focus_pos, 120);
    }

    #[test]
    fn test_lens_forced_when_af_disabled() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(
            &sensor,
            false,
            Isp3aResult {
                real_vcm_pos: 50,
                af_enabled: false,
                ..Default::default()
            },
        );

        run_once(&mut isp3a);
        run_once(&mut isp3a);
        assert_eq!(sensor.lens_positions(), vec![50, 50]);
    }

    #[test]
    fn test_lens_position_kept_on_failure() {
        let sensor = Arc::new(SimSensor::default());
        sensor.fail_lens(true);
        let mut isp3a = isp3a_with(
            &sensor,
            false,
            Isp3aResult {
                real_vcm_pos: 80,
                ..Default::default()
            },
        );

        run_once(&mut isp3a);
        assert_eq!(isp3a.ctrl_params().prev_focus_pos, 50);
    }

    #[test]
    fn test_algorithm_failure_keeps_result() {
        let sensor = Arc::new(SimSensor::default());
        let calls = Arc::new(Mutex::new(0));
        let calls_cb = calls.clone();
        let algorithm: BoxedAlgorithm = Box::new(move |_: &StatSections<'_>, prev: &Isp3aResult| {
            let mut calls = calls_cb.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(Isp3aResult {
                    exp_line_num: 300,
                    ..prev.clone()
                })
            } else {
                Err(anyhow::anyhow!("no convergence"))
            }
        });
        let mut isp3a = Isp3a::new(algorithm, sensor, None, false);

        run_once(&mut isp3a);
        run_once(&mut isp3a);
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(isp3a.result().exp_line_num, 300);
    }

    #[test]
    fn test_separate_exposure_update() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(
            &sensor,
            false,
            Isp3aResult {
                exp_line_num: 400,
                exp_analog_gain: 32,
                ..Default::default()
            },
        );
        run_once(&mut isp3a);
        isp3a.update_sensor_exposure();

        assert_eq!(sensor.exposures(), vec![400]);
        assert_eq!(sensor.gains(), vec![32]);
        assert!(sensor.combined().is_empty());
        let ctrl = isp3a.ctrl_params();
        assert_eq!((ctrl.prev_exp_line, ctrl.prev_ana_gain), (400, 32));
    }

    #[test]
    fn test_invalid_exposure_values_rejected() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(
            &sensor,
            false,
            Isp3aResult {
                exp_line_num: 0,
                exp_analog_gain: 15,
                ..Default::default()
            },
        );
        run_once(&mut isp3a);
        isp3a.update_sensor_exposure();

        assert!(sensor.exposures().is_empty());
        assert!(sensor.gains().is_empty());
        let ctrl = isp3a.ctrl_params();
        assert_eq!((ctrl.prev_exp_line, ctrl.prev_ana_gain), (16, 16));
    }

    #[test]
    fn test_combined_exposure_update() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(
            &sensor,
            true,
            Isp3aResult {
                exp_line_num: 200,
                exp_analog_gain: 64,
                ..Default::default()
            },
        );
        run_once(&mut isp3a);
        isp3a.update_sensor_exposure();

        assert_eq!(sensor.combined(), vec![(200, 64)]);
        assert!(sensor.exposures().is_empty());
    }

    #[test]
    fn test_combined_exposure_falls_back() {
        let sensor = Arc::new(SimSensor::default());
        sensor.fail_combined(true);
        let mut isp3a = isp3a_with(
            &sensor,
            true,
            Isp3aResult {
                exp_line_num: 200,
                exp_analog_gain: 64,
                ..Default::default()
            },
        );
        run_once(&mut isp3a);
        isp3a.update_sensor_exposure();

        assert!(sensor.combined().is_empty());
        assert_eq!(sensor.exposures(), vec![200]);
        assert_eq!(sensor.gains(), vec![64]);
    }

    #[test]
    fn test_close_resets_exposure_params() {
        let sensor = Arc::new(SimSensor::default());
        let mut isp3a = isp3a_with(&sensor, false, Isp3aResult::default());
        isp3a.on_close();
        let ctrl = isp3a.ctrl_params();
        assert_eq!((ctrl.prev_exp_line, ctrl.prev_ana_gain), (0, 1));
        assert_eq!(ctrl.prev_focus_pos, 50);
    }

    #[test]
    fn test_isp_tables_allocation() {
        let allocator = HeapAllocator::default();
        let tables = IspTables::allocate(&allocator).unwrap();

        let lut = tables.region(IspTable::Lut).unwrap();
        let lens = tables.region(IspTable::LensShading).unwrap();
        let drc = tables.region(IspTable::Drc).unwrap();
        let disc = tables.region(IspTable::Disc).unwrap();
        assert_eq!(lut.len, IspTable::Lut.size());
        assert_eq!(lens.dma.0 - lut.dma.0, IspTable::Lut.size() as u64);
        assert_eq!(disc.dma.0 - drc.dma.0, IspTable::Drc.size() as u64);

        tables.write(IspTable::Gamma, |t| t[0] = 0xaa).unwrap();
        assert_eq!(IspTable::n(2), Some(IspTable::Gamma));
    }
}
