//! Simulated ICS/OSC register file for host tests.
//!
//! Status fields follow the control fields after `latency` status reads,
//! the way the hardware multiplexers settle a few cycles after a write.
//! Individual flags can be stuck to exercise the timeout paths.

use core::cell::Cell;

use super::config::ClockMode;
use super::poll::TimeSource;
use super::regs::*;

/// Flags that never follow their control field.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Stuck {
    pub reference: bool,
    pub clock: bool,
    pub lock: bool,
    pub oscillator: bool,
}

#[derive(Debug)]
pub(crate) struct SimRegisters {
    regs: [Cell<u8>; 6],
    pending: Cell<u32>,
    pub latency: u32,
    pub stuck: Stuck,
    pub sopt: u32,
    pub busdiv: u32,
    pub writes: Vec<(Reg, u8)>,
}

fn index(reg: Reg) -> usize {
    match reg {
        Reg::C1 => 0,
        Reg::C2 => 1,
        Reg::C3 => 2,
        Reg::C4 => 3,
        Reg::S => 4,
        Reg::OscCr => 5,
    }
}

impl SimRegisters {
    /// Power-on-reset state: FEI, BDIV = 1, oscillator off.
    pub fn new() -> Self {
        Self {
            regs: [
                Cell::new(Reg::C1.reset_value()),
                Cell::new(Reg::C2.reset_value()),
                Cell::new(Reg::C3.reset_value()),
                Cell::new(Reg::C4.reset_value()),
                Cell::new(Reg::S.reset_value()),
                Cell::new(Reg::OscCr.reset_value()),
            ],
            pending: Cell::new(0),
            latency: 2,
            stuck: Stuck::default(),
            sopt: 0,
            busdiv: 0,
            writes: Vec::new(),
        }
    }

    /// A settled register file already sitting in `mode`, with the bus
    /// divider that mode's transitions leave behind.
    pub fn in_mode(mode: ClockMode) -> Self {
        let sim = Self::new();
        let external = mode.reference() == super::config::ReferenceSource::External;
        let mut c1 = Reg::C1.reset_value() & !(CLKS_MASK | IREFS_MASK);
        c1 |= mode.clock_source().bits() << 6;
        if !external {
            c1 |= IREFS_MASK;
        } else {
            // 10 MHz crystal
            c1 |= 3 << 3;
        }
        let mut c2 = (Reg::C2.reset_value() & !(BDIV_MASK | LP_MASK)) | (mode.bus_divider().bits() << 5);
        if mode.is_low_power() {
            c2 |= LP_MASK;
        }
        sim.raw_set(Reg::C1, c1);
        sim.raw_set(Reg::C2, c2);
        if external {
            sim.raw_set(Reg::OscCr, OSCEN_MASK | OSCOS_MASK | RANGE_MASK);
        }
        sim.settle();
        sim.raw_set(Reg::S, sim.raw(Reg::S) & !LOLS_MASK);
        sim
    }

    /// Set a register without recording a write or starting a settle.
    pub fn raw_set(&self, reg: Reg, value: u8) {
        self.regs[index(reg)].set(value);
    }

    pub fn raw(&self, reg: Reg) -> u8 {
        self.regs[index(reg)].get()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Writes to `reg`, in order.
    pub fn writes_to(&self, reg: Reg) -> Vec<u8> {
        self.writes.iter().filter(|(r, _)| *r == reg).map(|(_, v)| *v).collect()
    }

    fn settle(&self) {
        let c1 = self.raw(Reg::C1);
        let c2 = self.raw(Reg::C2);
        let old = self.raw(Reg::S);
        let mut status = old;

        if !self.stuck.reference {
            status = (status & !IREFST_MASK) | if c1 & IREFS_MASK != 0 { IREFST_MASK } else { 0 };
        }
        if !self.stuck.clock {
            status = (status & !CLKST_MASK) | (((c1 & CLKS_MASK) >> 6) << 2);
        }
        let fll_on = c1 & CLKS_MASK == 0 || c2 & LP_MASK == 0;
        let locked = fll_on && !self.stuck.lock;
        status = (status & !LOCK_MASK) | if locked { LOCK_MASK } else { 0 };
        if (old ^ status) & IREFST_MASK != 0 {
            status |= LOLS_MASK;
        }
        self.raw_set(Reg::S, status);

        let cr = self.raw(Reg::OscCr);
        let ready = cr & OSCEN_MASK != 0 && !self.stuck.oscillator;
        self.raw_set(Reg::OscCr, (cr & !OSCINIT_MASK) | if ready { OSCINIT_MASK } else { 0 });
    }

    fn tick(&self) {
        let pending = self.pending.get();
        if pending > 0 {
            self.pending.set(pending - 1);
        } else {
            self.settle();
        }
    }
}

impl IcsRegisters for SimRegisters {
    fn read(&self, reg: Reg) -> u8 {
        if matches!(reg, Reg::S | Reg::OscCr) {
            self.tick();
        }
        self.raw(reg)
    }

    fn write(&mut self, reg: Reg, value: u8) {
        self.writes.push((reg, value));
        match reg {
            Reg::S => {
                if value & LOLS_MASK != 0 {
                    self.raw_set(Reg::S, self.raw(Reg::S) & !LOLS_MASK);
                }
            }
            Reg::OscCr => {
                let init = self.raw(Reg::OscCr) & OSCINIT_MASK;
                let keep = if value & OSCEN_MASK != 0 { init } else { 0 };
                self.raw_set(Reg::OscCr, (value & !OSCINIT_MASK) | keep);
                self.pending.set(self.latency);
            }
            _ => {
                self.raw_set(reg, value);
                self.pending.set(self.latency);
            }
        }
    }

    fn read_sim(&self, reg: SimReg) -> u32 {
        match reg {
            SimReg::Sopt => self.sopt,
            SimReg::Busdiv => self.busdiv,
        }
    }
}

/// Deterministic time: every sample advances one microsecond.
#[derive(Debug, Default)]
pub(crate) struct SimTime {
    now: u32,
}

impl SimTime {
    pub fn starting_at(now: u32) -> Self {
        Self { now }
    }
}

impl TimeSource for SimTime {
    fn now_us(&mut self) -> u32 {
        self.now = self.now.wrapping_add(1);
        self.now
    }
}
