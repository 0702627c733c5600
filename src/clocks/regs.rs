//! Register access surface for the ICS, OSC and SIM blocks.
//!
//! Controller code never touches raw words. It goes through the typed
//! field accessors of [`Fields`], which are implemented for every
//! [`IcsRegisters`] backend.

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use paste::paste;

/// 8-bit ICS and OSC registers touched by the controller.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    /// `ICS_C1`: reference select, reference divider, clock select
    C1,
    /// `ICS_C2`: bus divider, low power
    C2,
    /// `ICS_C3`: IRC trim, low 8 bits
    C3,
    /// `ICS_C4`: IRC trim bit 8, loss-of-lock interrupt, clock monitor
    C4,
    /// `ICS_S`: status
    S,
    /// `OSC_CR`: oscillator control and status
    OscCr,
}

impl Reg {
    /// Byte offset from the block base.
    pub const fn offset(self) -> usize {
        match self {
            Reg::C1 => 0x0,
            Reg::C2 => 0x1,
            Reg::C3 => 0x2,
            Reg::C4 => 0x3,
            Reg::S => 0x4,
            Reg::OscCr => 0x0,
        }
    }

    /// Power-on-reset value.
    pub const fn reset_value(self) -> u8 {
        match self {
            Reg::C1 => 0x04,
            Reg::C2 => 0x20,
            Reg::C3 => 0x54,
            Reg::C4 => 0x00,
            Reg::S => 0x50,
            Reg::OscCr => 0x00,
        }
    }
}

/// 32-bit SIM registers. Written by the startup code, only read here.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimReg {
    /// `SIM_SOPT`
    Sopt,
    /// `SIM_BUSDIV`
    Busdiv,
}

impl SimReg {
    /// Byte offset from the SIM base.
    pub const fn offset(self) -> usize {
        match self {
            SimReg::Sopt => 0x04,
            SimReg::Busdiv => 0x18,
        }
    }
}

/// Raw register backend. Implemented by [`Mmio`] on hardware and by a
/// simulated register file in tests.
pub trait IcsRegisters {
    /// Read one 8-bit register.
    fn read(&self, reg: Reg) -> u8;
    /// Write one 8-bit register.
    fn write(&mut self, reg: Reg, value: u8);
    /// Read one SIM register.
    fn read_sim(&self, reg: SimReg) -> u32;

    /// Read-modify-write of the bits under `mask`.
    fn modify(&mut self, reg: Reg, mask: u8, value: u8) {
        let current = self.read(reg);
        self.write(reg, (current & !mask) | (value & mask));
    }
}

impl<R: IcsRegisters + ?Sized> IcsRegisters for &mut R {
    fn read(&self, reg: Reg) -> u8 {
        (**self).read(reg)
    }

    fn write(&mut self, reg: Reg, value: u8) {
        (**self).write(reg, value)
    }

    fn read_sim(&self, reg: SimReg) -> u32 {
        (**self).read_sim(reg)
    }
}

/// Mask for a `width` bit field at `shift`.
pub const fn mask(shift: u8, width: u8) -> u8 {
    (((1u16 << width) - 1) << shift) as u8
}

macro_rules! fields {
    (@setter $name:ident, $reg:ident, $shift:literal) => {
        paste! {
            #[doc = concat!("Read-modify-write of `", stringify!($name), "`.")]
            fn [<set_ $name>](&mut self, value: u8) {
                self.modify(Reg::$reg, [<$name:upper _MASK>], value << $shift);
            }
        }
    };
    (@setter $name:ident, $reg:ident, $shift:literal, ro) => {};
    ($(
        $(#[$doc:meta])*
        $name:ident: $reg:ident [$shift:literal ; $width:literal] $($access:ident)?
    ),* $(,)?) => {
        paste! {
            $(
                #[doc = concat!("Mask of the `", stringify!($name), "` field in `", stringify!($reg), "`.")]
                pub const [<$name:upper _MASK>]: u8 = mask($shift, $width);
            )*

            /// Typed bit-field view over an [`IcsRegisters`] backend.
            pub trait Fields: IcsRegisters {
                $(
                    $(#[$doc])*
                    fn $name(&self) -> u8 {
                        (self.read(Reg::$reg) & [<$name:upper _MASK>]) >> $shift
                    }

                    fields!(@setter $name, $reg, $shift $(, $access)?);
                )*
            }
        }
    };
}

fields! {
    /// `C1[CLKS]`: ICSOUT source, see [`ClockSource`](super::config::ClockSource)
    clks: C1[6; 2],
    /// `C1[RDIV]`: external reference divider exponent
    rdiv: C1[3; 3],
    /// `C1[IREFS]`: 1 = internal reference for the FLL
    irefs: C1[2; 1],
    /// `C1[IRCLKEN]`: ICSIRCLK enable
    irclken: C1[1; 1],
    /// `C1[IREFSTEN]`: internal reference enabled in stop
    irefsten: C1[0; 1],
    /// `C2[BDIV]`: ICSOUT divider exponent
    bdiv: C2[5; 3],
    /// `C2[LP]`: FLL disabled in bypass modes
    lp: C2[4; 1],
    /// `C3[SCTRIM]`: IRC trim, low 8 bits
    sctrim: C3[0; 8],
    /// `C4[LOLIE]`: loss-of-lock interrupt enable
    lolie: C4[7; 1],
    /// `C4[CME]`: clock monitor enable
    cme: C4[5; 1],
    /// `C4[SCFTRIM]`: IRC trim, bit 8
    scftrim: C4[0; 1],
    /// `S[LOLS]`: sticky loss of lock, write one to clear
    lols: S[7; 1] ro,
    /// `S[LOCK]`: FLL locked
    lock: S[6; 1] ro,
    /// `S[IREFST]`: 1 = internal reference active
    irefst: S[4; 1] ro,
    /// `S[CLKST]`: ICSOUT source currently in effect
    clkst: S[2; 2] ro,
    /// `OSC_CR[OSCEN]`
    oscen: OscCr[7; 1],
    /// `OSC_CR[OSCSTEN]`
    oscsten: OscCr[5; 1],
    /// `OSC_CR[OSCOS]`: 1 = crystal oscillator output
    oscos: OscCr[4; 1],
    /// `OSC_CR[RANGE]`: 1 = high range
    range: OscCr[2; 1],
    /// `OSC_CR[HGO]`: 1 = high gain
    hgo: OscCr[1; 1],
    /// `OSC_CR[OSCINIT]`: oscillator initialized
    oscinit: OscCr[0; 1] ro,
}

impl<R: IcsRegisters + ?Sized> Fields for R {}

/// `SIM_SOPT[BUSREF]`: bus clock output divider exponent.
pub const SIM_SOPT_BUSREF_SHIFT: u32 = 16;
/// Mask of `SIM_SOPT[BUSREF]`.
pub const SIM_SOPT_BUSREF_MASK: u32 = 0b111 << SIM_SOPT_BUSREF_SHIFT;
/// Mask of `SIM_BUSDIV[BUSDIV]`.
pub const SIM_BUSDIV_BUSDIV_MASK: u32 = 0b1;

/// Write-one-to-clear the sticky loss-of-lock flag.
pub(crate) fn clear_loss_of_lock<R: IcsRegisters + ?Sized>(regs: &mut R) {
    let status = regs.read(Reg::S);
    regs.write(Reg::S, status | LOLS_MASK);
}

/// Snapshot of the fields the Frequency Oracle needs.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// `C1[CLKS]`
    pub clks: u8,
    /// `C1[IREFS]`
    pub irefs: bool,
    /// `C1[RDIV]`
    pub rdiv: u8,
    /// `C2[BDIV]`
    pub bdiv: u8,
    /// `C2[LP]`
    pub lp: bool,
    /// `SIM_BUSDIV[BUSDIV]`
    pub busdiv: u8,
    /// `SIM_SOPT[BUSREF]`
    pub busref: u8,
}

impl Snapshot {
    /// Read every field in one pass.
    pub fn capture<R: IcsRegisters + ?Sized>(regs: &R) -> Self {
        let c1 = regs.read(Reg::C1);
        let c2 = regs.read(Reg::C2);
        Self {
            clks: (c1 & CLKS_MASK) >> 6,
            irefs: c1 & IREFS_MASK != 0,
            rdiv: (c1 & RDIV_MASK) >> 3,
            bdiv: (c2 & BDIV_MASK) >> 5,
            lp: c2 & LP_MASK != 0,
            busdiv: (regs.read_sim(SimReg::Busdiv) & SIM_BUSDIV_BUSDIV_MASK) as u8,
            busref: ((regs.read_sim(SimReg::Sopt) & SIM_SOPT_BUSREF_MASK) >> SIM_SOPT_BUSREF_SHIFT) as u8,
        }
    }
}

/// `ICS` register block.
#[repr(C)]
struct IcsBlock {
    c1: u8,
    c2: u8,
    c3: u8,
    c4: u8,
    s: u8,
}

/// `OSC` register block.
#[repr(C)]
struct OscBlock {
    cr: u8,
}

/// The start of the `SIM` block, up to `BUSDIV`.
#[repr(C)]
struct SimBlock {
    _reserved0: u32,
    sopt: u32,
    _reserved1: [u32; 4],
    busdiv: u32,
}

/// Memory-mapped register blocks of the NV32.
///
/// There is exactly one of these per chip. It is not `Clone`, so ownership
/// of the handle serializes every access.
#[derive(Debug)]
pub struct Mmio {
    ics: *mut IcsBlock,
    osc: *mut OscBlock,
    sim: *const SimBlock,
}

impl Mmio {
    /// `ICS` base address
    pub const ICS_BASE: usize = 0x4006_4000;
    /// `OSC` base address
    pub const OSC_BASE: usize = 0x4006_5000;
    /// `SIM` base address
    pub const SIM_BASE: usize = 0x4004_8000;

    /// Take the register blocks.
    ///
    /// # Safety
    ///
    /// Must be called at most once, and nothing else may access the ICS or
    /// OSC blocks while the returned handle is alive.
    pub unsafe fn steal() -> Self {
        Self::at(
            Self::ICS_BASE as *mut IcsBlock,
            Self::OSC_BASE as *mut OscBlock,
            Self::SIM_BASE as *const SimBlock,
        )
    }

    const fn at(ics: *mut IcsBlock, osc: *mut OscBlock, sim: *const SimBlock) -> Self {
        Self { ics, osc, sim }
    }

    fn register(&self, reg: Reg) -> *mut u8 {
        // SAFETY: only forms a field address inside a block this handle owns
        unsafe {
            match reg {
                Reg::C1 => addr_of_mut!((*self.ics).c1),
                Reg::C2 => addr_of_mut!((*self.ics).c2),
                Reg::C3 => addr_of_mut!((*self.ics).c3),
                Reg::C4 => addr_of_mut!((*self.ics).c4),
                Reg::S => addr_of_mut!((*self.ics).s),
                Reg::OscCr => addr_of_mut!((*self.osc).cr),
            }
        }
    }
}

impl IcsRegisters for Mmio {
    fn read(&self, reg: Reg) -> u8 {
        // SAFETY: field of a register block owned by this handle
        unsafe { read_volatile(self.register(reg)) }
    }

    fn write(&mut self, reg: Reg, value: u8) {
        // SAFETY: field of a register block owned by this handle
        unsafe { write_volatile(self.register(reg), value) }
    }

    fn read_sim(&self, reg: SimReg) -> u32 {
        // SAFETY: SIM is only read from here
        unsafe {
            match reg {
                SimReg::Sopt => read_volatile(addr_of!((*self.sim).sopt)),
                SimReg::Busdiv => read_volatile(addr_of!((*self.sim).busdiv)),
            }
        }
    }
}
