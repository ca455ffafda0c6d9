/// Flat byte-addressable register store consulted by the slave engine.
///
/// Addresses cover the full 8-bit domain; callers stepping past `0xFF` wrap
/// back to `0x00`.
pub trait RegisterBackend {
    fn read(&mut self, address: u8) -> u8;
    fn write(&mut self, address: u8, value: u8);
}

impl<B: RegisterBackend + ?Sized> RegisterBackend for &mut B {
    fn read(&mut self, address: u8) -> u8 {
        (**self).read(address)
    }

    fn write(&mut self, address: u8, value: u8) {
        (**self).write(address, value)
    }
}

impl<B: RegisterBackend + ?Sized> RegisterBackend for Box<B> {
    fn read(&mut self, address: u8) -> u8 {
        (**self).read(address)
    }

    fn write(&mut self, address: u8, value: u8) {
        (**self).write(address, value)
    }
}
