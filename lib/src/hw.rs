//! Ports to the capture hardware.
//!
//! The CSI receiver and the ISP are reached through the `CsiEngine` and
//! `IspEngine` traits. Implementations are expected to be thin wrappers around
//! register accesses: every method is called from interrupt context at some
//! point and must neither block nor sleep.
pub mod sim;

use bitflags::bitflags;

use crate::isp::IspTables;
use crate::memory::DmaAddr;
use crate::CaptureMode;

bitflags! {
    /// Interrupt status bits of one CSI channel.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CsiIrq: u32 {
        const CAPTURE_DONE = 1 << 0;
        const FRAME_DONE = 1 << 1;
        const BUF_0_OVERFLOW = 1 << 2;
        const BUF_1_OVERFLOW = 1 << 3;
        const BUF_2_OVERFLOW = 1 << 4;
        const PROTECTION_ERROR = 1 << 5;
        const HBLANK_OVERFLOW = 1 << 6;
        const VSYNC_TRIG = 1 << 7;

        const FIFO_OVERFLOW = Self::BUF_0_OVERFLOW.bits()
            | Self::BUF_1_OVERFLOW.bits()
            | Self::BUF_2_OVERFLOW.bits();
        const OVERFLOW = Self::FIFO_OVERFLOW.bits() | Self::HBLANK_OVERFLOW.bits();
        /// Events that carry a frame boundary.
        const EVENTS = Self::CAPTURE_DONE.bits()
            | Self::FRAME_DONE.bits()
            | Self::VSYNC_TRIG.bits();
        const ALL = Self::EVENTS.bits()
            | Self::OVERFLOW.bits()
            | Self::PROTECTION_ERROR.bits();
    }
}

bitflags! {
    /// Interrupt status bits of the ISP.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct IspIrq: u32 {
        const FINISH = 1 << 0;
        const START = 1 << 1;
        const PARA_SAVE = 1 << 2;
        const PARA_LOAD = 1 << 3;
        const SRC0_FIFO_OVERFLOW = 1 << 4;
        const SRC1_FIFO_OVERFLOW = 1 << 5;
        const ROT_FINISH = 1 << 6;

        const ALL = Self::FINISH.bits()
            | Self::START.bits()
            | Self::PARA_SAVE.bits()
            | Self::PARA_LOAD.bits()
            | Self::SRC0_FIFO_OVERFLOW.bits()
            | Self::SRC1_FIFO_OVERFLOW.bits()
            | Self::ROT_FINISH.bits();
    }
}

/// Register interface of the CSI receiver.
pub trait CsiEngine: Send + Sync {
    fn int_status(&self, channel: usize) -> CsiIrq;
    fn clear_int_status(&self, channel: usize, irq: CsiIrq);
    fn enable_int(&self, channel: usize, irq: CsiIrq);
    fn disable_int(&self, channel: usize, irq: CsiIrq);
    /// Program the address the next frame of `channel` will be written to.
    fn set_output_addr(&self, channel: usize, addr: DmaAddr);
    /// Soft-reset the capture engine after an overflow.
    fn reset(&self);
    fn enable(&self);
    fn disable(&self);
    /// Start or stop video capture on all channels.
    fn set_streaming(&self, on: bool);
}

/// Register interface of the ISP, including its statistics engine.
pub trait IspEngine: Send + Sync {
    fn irq_status(&self) -> IspIrq;
    fn clear_irq_status(&self, irq: IspIrq);
    fn enable_irq(&self, irq: IspIrq);
    fn disable_irq(&self, irq: IspIrq);
    /// Program the address the next frame of `channel` will be written to.
    fn set_output_addr(&self, channel: usize, addr: DmaAddr);
    /// Program the address the statistics of the next frame will be written
    /// to.
    fn set_statistics_addr(&self, addr: DmaAddr);
    /// Tell the ISP whether its parameter registers may be latched.
    fn set_para_ready(&self, ready: bool);
    /// Hand the addresses of the processing tables to the ISP.
    fn load_tables(&self, tables: &IspTables);
    fn enable(&self);
    fn disable(&self);
    fn start_capture(&self, mode: CaptureMode);
    fn stop_capture(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csi_irq_groups() {
        assert!(CsiIrq::OVERFLOW.contains(CsiIrq::BUF_1_OVERFLOW));
        assert!(CsiIrq::OVERFLOW.contains(CsiIrq::HBLANK_OVERFLOW));
        assert!(!CsiIrq::OVERFLOW.intersects(CsiIrq::EVENTS));
        assert_eq!(CsiIrq::ALL.bits(), 0xff);

        let status = CsiIrq::FRAME_DONE | CsiIrq::BUF_2_OVERFLOW;
        assert!(status.intersects(CsiIrq::EVENTS));
        assert!(status.intersects(CsiIrq::OVERFLOW));
    }
}
