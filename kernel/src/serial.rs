//! Serial port output.
//!
//! COM1 (0x3F8) is the kernel's earliest and most reliable output channel;
//! the fault paths write here after any video console is gone.

use core::fmt::{self, Write};
use spin::Mutex;
use x86_64::instructions::port::{PortReadOnly, PortWriteOnly};

/// COM1 port address
const COM1: u16 = 0x3F8;

/// Write a byte to an I/O port.
unsafe fn port_write(port: u16, value: u8) {
    PortWriteOnly::new(port).write(value);
}

/// Read a byte from an I/O port.
unsafe fn port_read(port: u16) -> u8 {
    PortReadOnly::new(port).read()
}

/// Serial port writer
pub struct SerialWriter {
    initialized: bool,
}

impl SerialWriter {
    /// Program the UART: 115200 baud, 8N1, FIFOs on.
    fn init(&mut self) {
        unsafe {
            port_write(COM1 + 1, 0x00); // Disable interrupts
            port_write(COM1 + 3, 0x80); // DLAB on
            port_write(COM1, 0x01); // Divisor low: 115200 baud
            port_write(COM1 + 1, 0x00); // Divisor high
            port_write(COM1 + 3, 0x03); // 8 bits, no parity, one stop
            port_write(COM1 + 2, 0xC7); // FIFO on, clear, 14-byte threshold
            port_write(COM1 + 4, 0x0B); // DTR + RTS + OUT2
        }
        self.initialized = true;
    }

    fn write_byte(&mut self, byte: u8) {
        if !self.initialized {
            self.init();
        }
        unsafe {
            // Wait for the transmit buffer to drain
            while (port_read(COM1 + 5) & 0x20) == 0 {}
            port_write(COM1, byte);
        }
    }
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global serial writer
static WRITER: Mutex<SerialWriter> = Mutex::new(SerialWriter { initialized: false });

/// Initialize the serial console early in boot.
pub fn init() {
    WRITER.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = WRITER.lock().write_fmt(args);
}

/// Print to the serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

/// Print with newline to the serial port
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
