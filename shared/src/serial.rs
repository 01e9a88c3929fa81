//! Write-only driver for the first serial port, the kernel's log sink.
//!
//! Initialization sequence from https://wiki.osdev.org/Serial_Ports.

use core::{arch::asm, fmt};

const COM1: u16 = 0x3f8;
const THR: u16 = COM1; // Transmitter Holding Reg (write-only)
const RBR: u16 = COM1; // Receiver Buffer Reg (read-only)
const IER: u16 = COM1 + 1; // Interrupt Enable Reg
const FCR: u16 = COM1 + 2; // FIFO Control Reg (write-only)
const LCR: u16 = COM1 + 3; // Line Control Reg
const MCR: u16 = COM1 + 4; // MODEM Control Reg
const LSR: u16 = COM1 + 5; // Line Status Reg (read-only)

unsafe fn outb(port: u16, byte: u8) {
    asm!("out dx, al", in("dx") port, in("al") byte);
}

unsafe fn inb(port: u16) -> u8 {
    let res: u8;
    asm!("in al, dx", in("dx") port, out("al") res);
    res
}

pub struct SerialWriter {
    initialized: bool,
}

impl SerialWriter {
    /// Configures the port on first use: 38400 baud, 8 data bits, no
    /// parity, FIFOs on, then a loopback self-test.
    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }

        // SAFETY: the port writes below follow the documented init order.
        unsafe {
            outb(IER, 0x00);
            outb(LCR, 0x80);
            outb(THR, 0x03);
            outb(IER, 0x00);
            outb(LCR, 0x03);
            outb(FCR, 0xC7);
            outb(MCR, 0x0B);

            outb(MCR, 0x1E); // Enable loopback.

            const EXPECTED: u8 = 0xAE;
            outb(THR, EXPECTED);
            let actual = inb(RBR);
            assert!(
                actual == EXPECTED,
                "faulty serial, expected {EXPECTED:#X}, got {actual:#X}"
            );

            outb(MCR, 0x0F); // Disable loopback.
        }

        self.initialized = true;
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: waits for the holding register to drain before writing.
        unsafe {
            while inb(LSR) & 0x20 == 0 {}
            outb(THR, byte);
        }
    }
}

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.ensure_initialized();
        for b in s.bytes() {
            self.write_byte(b);
        }
        Ok(())
    }
}

pub static mut SERIAL_WRITER: SerialWriter = SerialWriter { initialized: false };
