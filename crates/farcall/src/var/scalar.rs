use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::proto::{Kind, WireValue};

use super::{raw_bytes, raw_bytes_mut, read_remote, write_remote, Block, RemoteSlot, Var};

mod private {
    pub trait Sealed {}
}

/// Primitive value types marshallable through the fixed-width wire slot.
pub trait ScalarType: Copy + std::fmt::Debug + Send + 'static + private::Sealed {
    const KIND: Kind;

    fn to_wire(self) -> WireValue;
    fn from_wire(value: WireValue) -> Option<Self>;
}

macro_rules! int_scalar {
    ($($ty:ty),*) => {
        $(
            impl private::Sealed for $ty {}

            impl ScalarType for $ty {
                const KIND: Kind = Kind::Int;

                fn to_wire(self) -> WireValue {
                    WireValue::Int(self as i64)
                }

                fn from_wire(value: WireValue) -> Option<Self> {
                    // Narrowing mirrors what reading the value slot through
                    // a smaller C type would do.
                    value.as_int().map(|v| v as $ty)
                }
            }
        )*
    };
}

macro_rules! float_scalar {
    ($($ty:ty),*) => {
        $(
            impl private::Sealed for $ty {}

            impl ScalarType for $ty {
                const KIND: Kind = Kind::Float;

                fn to_wire(self) -> WireValue {
                    WireValue::Float(self as f64)
                }

                fn from_wire(value: WireValue) -> Option<Self> {
                    value.as_float().map(|v| v as $ty)
                }
            }
        )*
    };
}

int_scalar!(i8, i16, i32, i64, u8, u16, u32, u64);
float_scalar!(f32, f64);

/// A by-value integer or float argument, or a scalar return slot.
#[derive(Debug)]
pub struct Scalar<T: ScalarType> {
    value: T,
    remote: RemoteSlot,
}

impl<T: ScalarType> Scalar<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            remote: RemoteSlot::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }
}

impl<T: ScalarType> Var for Scalar<T> {
    fn kind(&self) -> Kind {
        T::KIND
    }

    fn size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn remote(&self) -> Option<u64> {
        self.remote.addr()
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        vec![Block {
            len: std::mem::size_of::<T>(),
            slot: &mut self.remote,
        }]
    }

    fn transfer_to(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        write_remote(pid, addr, raw_bytes(&self.value))
    }

    fn transfer_from(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        read_remote(pid, addr, raw_bytes_mut(&mut self.value))
    }

    fn wire_value(&self) -> WireValue {
        self.value.to_wire()
    }

    fn set_wire_value(&mut self, value: WireValue) -> Result<()> {
        self.value = T::from_wire(value)
            .ok_or_else(|| Error::precondition("wire value does not match the variable type"))?;
        Ok(())
    }
}

/// Return slot for functions that return nothing.
#[derive(Debug, Default)]
pub struct Void;

impl Var for Void {
    fn kind(&self) -> Kind {
        Kind::Void
    }

    fn size(&self) -> usize {
        0
    }

    fn remote(&self) -> Option<u64> {
        None
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        Vec::new()
    }

    fn transfer_to(&mut self, _pid: Pid) -> Result<()> {
        Err(Error::precondition("void carries no data"))
    }

    fn transfer_from(&mut self, _pid: Pid) -> Result<()> {
        Err(Error::precondition("void carries no data"))
    }

    fn wire_value(&self) -> WireValue {
        WireValue::Int(0)
    }

    fn set_wire_value(&mut self, _value: WireValue) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_wire_round_trip() {
        let mut var: Scalar<i32> = Scalar::new(-7);
        assert_eq!(var.kind(), Kind::Int);
        assert_eq!(var.size(), 4);
        assert_eq!(var.wire_value(), WireValue::Int(-7));

        var.set_wire_value(WireValue::Int(41)).unwrap();
        assert_eq!(var.get(), 41);
    }

    #[test]
    fn float_wire_round_trip() {
        let mut var: Scalar<f64> = Scalar::new(1.5);
        assert_eq!(var.kind(), Kind::Float);
        assert_eq!(var.wire_value(), WireValue::Float(1.5));

        var.set_wire_value(WireValue::Float(-2.25)).unwrap();
        assert_eq!(var.get(), -2.25);
    }

    #[test]
    fn narrowing_matches_c_semantics() {
        let mut var: Scalar<u8> = Scalar::new(0);
        var.set_wire_value(WireValue::Int(0x1FF)).unwrap();
        assert_eq!(var.get(), 0xFF);
    }

    #[test]
    fn mismatched_wire_value_rejected() {
        let mut var: Scalar<i64> = Scalar::new(0);
        let error = var.set_wire_value(WireValue::Float(1.0)).unwrap_err();
        assert!(matches!(error, Error::FailedPrecondition(_)));
    }
}
