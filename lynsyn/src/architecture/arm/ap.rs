//! Memory access port registers.

use bitfield::bitfield;

use super::Register;

/// A register of a memory access port.
pub trait ApRegister: Register {}

macro_rules! define_ap_register {
    ($(#[$outer:meta])* $name:ident, $address:expr) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name(pub u32);

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(raw: $name) -> Self {
                raw.0
            }
        }

        impl ApRegister for $name {}

        impl Register for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = stringify!($name);
        }
    };
}

define_ap_register!(
    /// Transfer address, low word.
    Tar,
    0x04
);
define_ap_register!(
    /// Transfer address, high word. Only present on APs with 64-bit addressing.
    TarHi,
    0x08
);
define_ap_register!(
    /// Data read/write. Accesses the memory at the transfer address.
    Drw,
    0x0C
);
define_ap_register!(
    /// Debug base address, bit 0 marks a valid ROM table.
    Base,
    0xF8
);

impl Base {
    /// Whether a ROM table is present.
    pub fn present(&self) -> bool {
        self.0 & 1 != 0
    }

    /// The address of the ROM table.
    pub fn address(&self) -> u32 {
        self.0 & 0xFFFF_F000
    }
}

bitfield! {
    /// Control/status word.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub device_en, _: 6;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    /// CSW written to APB-APs before walking their ROM table: debug software access, word
    /// transfers, no address increment.
    pub const APB_WORD: Csw = Csw(0x8000_0042);
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl ApRegister for Csw {}

impl Register for Csw {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

bitfield! {
    /// Configuration register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Cfg(u32);
    impl Debug;
    pub large_data, _: 2;
    pub large_address, _: 1;
    pub big_endian, _: 0;
}

impl From<u32> for Cfg {
    fn from(raw: u32) -> Self {
        Cfg(raw)
    }
}

impl From<Cfg> for u32 {
    fn from(raw: Cfg) -> Self {
        raw.0
    }
}

impl ApRegister for Cfg {}

impl Register for Cfg {
    const ADDRESS: u8 = 0xF4;
    const NAME: &'static str = "CFG";
}

bitfield! {
    /// Identification register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u16, designer, _: 27, 17;
    pub u8, class, _: 16, 13;
    pub u8, variant, _: 7, 4;
    pub u8, ap_type, _: 3, 0;
}

impl Idr {
    /// The kind of memory bus behind the port, if it is an ARM memory AP.
    pub fn ap_class(&self) -> Option<ApClass> {
        match self.0 & 0x0FFF_FF0F {
            0x0477_0001 => Some(ApClass::AmbaAhb),
            0x0477_0002 => Some(ApClass::AmbaApb),
            0x0477_0004 => Some(ApClass::AmbaAxi),
            _ => None,
        }
    }
}

impl From<u32> for Idr {
    fn from(raw: u32) -> Self {
        Idr(raw)
    }
}

impl From<Idr> for u32 {
    fn from(raw: Idr) -> Self {
        raw.0
    }
}

impl ApRegister for Idr {}

impl Register for Idr {
    const ADDRESS: u8 = 0xFC;
    const NAME: &'static str = "IDR";
}

/// The bus an ARM memory access port connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApClass {
    /// AMBA AHB bus.
    AmbaAhb,
    /// AMBA APB bus, usually the debug bus with the core debug registers.
    AmbaApb,
    /// AMBA AXI bus, usually the system memory.
    AmbaAxi,
}
