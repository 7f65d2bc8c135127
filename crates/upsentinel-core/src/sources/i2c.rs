//! Minimal I2C access for the UPS sensors.
//!
//! Both supported devices expose 16-bit big-endian registers, so the only
//! transaction needed is "write register pointer, read two bytes". The
//! [`I2cBus`] trait keeps that seam mockable; [`LinuxI2cBus`] talks to
//! `/dev/i2c-N` through the i2c-dev ioctl interface.

use std::io;
use std::path::PathBuf;

/// `I2C_SLAVE` from `<linux/i2c-dev.h>`.
#[cfg(target_os = "linux")]
const I2C_SLAVE: u64 = 0x0703;

/// A bus that can read 16-bit MSB-first registers.
pub trait I2cBus: Send + Sync {
    /// Bus number, for logging and health reports.
    fn number(&self) -> u8;

    /// Read register `reg` of the device at 7-bit address `addr`.
    fn read_word_be(&self, addr: u8, reg: u8) -> io::Result<u16>;
}

/// `/dev/i2c-N` character device.
pub struct LinuxI2cBus {
    number: u8,
    path: PathBuf,
}

impl LinuxI2cBus {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            path: PathBuf::from(format!("/dev/i2c-{number}")),
        }
    }

    /// Whether the device node exists.
    pub fn is_present(&self) -> bool {
        self.path.exists()
    }
}

impl I2cBus for LinuxI2cBus {
    fn number(&self) -> u8 {
        self.number
    }

    #[cfg(target_os = "linux")]
    fn read_word_be(&self, addr: u8, reg: u8) -> io::Result<u16> {
        use std::fs::OpenOptions;
        use std::io::{Read, Write};
        use std::os::unix::io::AsRawFd;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: fd is a valid open i2c-dev descriptor for the lifetime of
        // `file`; I2C_SLAVE takes the address by value.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE as _, addr as libc::c_ulong) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        file.write_all(&[reg])?;
        let mut buf = [0u8; 2];
        file.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    #[cfg(not(target_os = "linux"))]
    fn read_word_be(&self, _addr: u8, _reg: u8) -> io::Result<u16> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "i2c-dev is only available on Linux",
        ))
    }
}

/// Build one [`LinuxI2cBus`] per configured bus number, skipping nodes that
/// don't exist.
pub fn linux_buses(numbers: &[u8]) -> Vec<Box<dyn I2cBus>> {
    numbers
        .iter()
        .map(|&n| LinuxI2cBus::new(n))
        .filter(|b| b.is_present())
        .map(|b| Box::new(b) as Box<dyn I2cBus>)
        .collect()
}

#[cfg(test)]
pub(crate) mod mock {
    //! Register-map bus used by the source tests.

    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    use super::I2cBus;

    pub struct MockBus {
        pub number: u8,
        pub regs: Mutex<HashMap<(u8, u8), u16>>,
    }

    impl MockBus {
        pub fn new(number: u8) -> Self {
            Self {
                number,
                regs: Mutex::new(HashMap::new()),
            }
        }

        pub fn with(self, addr: u8, reg: u8, value: u16) -> Self {
            self.regs.lock().unwrap().insert((addr, reg), value);
            self
        }

        pub fn set(&self, addr: u8, reg: u8, value: u16) {
            self.regs.lock().unwrap().insert((addr, reg), value);
        }
    }

    impl I2cBus for MockBus {
        fn number(&self) -> u8 {
            self.number
        }

        fn read_word_be(&self, addr: u8, reg: u8) -> io::Result<u16> {
            self.regs
                .lock()
                .unwrap()
                .get(&(addr, reg))
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "nack"))
        }
    }
}
