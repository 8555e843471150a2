/// A memory mapped register, for instance ARM debug registers (DSCR, PRSR, etc).
pub trait MemoryMappedRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// The register's offset from the base of the component it belongs to.
    const ADDRESS: u64;
    /// The register's name.
    const NAME: &'static str;

    /// The register's address for a component at `base_address`.
    fn get_mmio_address_from_base(base_address: u64) -> u64 {
        base_address + Self::ADDRESS
    }
}

/// Defines a [`MemoryMappedRegister`] with bitfield accessors.
macro_rules! memory_mapped_bitfield_register {
    (
        $(#[$outer:meta])*
        pub struct $reg:ident(u32);
        $address:expr, $name:expr,
        impl From;
        $($rest:tt)*
    ) => {
        bitfield::bitfield! {
            $(#[$outer])*
            #[derive(Copy, Clone, Default, PartialEq, Eq)]
            pub struct $reg(u32);
            impl Debug;
            $($rest)*
        }

        impl From<u32> for $reg {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<$reg> for u32 {
            fn from(register: $reg) -> Self {
                register.0
            }
        }

        impl $crate::architecture::arm::core::memory_mapped_registers::MemoryMappedRegister
            for $reg
        {
            const ADDRESS: u64 = $address;
            const NAME: &'static str = $name;
        }
    };
}

pub(crate) use memory_mapped_bitfield_register;
