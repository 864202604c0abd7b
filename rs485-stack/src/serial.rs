//! Opens and configures the RS-485 character device. Grounded on
//! `red_rs485_extension.c`'s `serial_interface_init`, translated from
//! raw `termios`/`ioctl` calls to the `libc` bindings the teacher already
//! depends on elsewhere in the pack.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StopBits {
    One,
    Two,
}

pub struct SerialConfig {
    pub baudrate: u32,
    pub parity: Parity,
    pub stopbits: StopBits,
}

/// Opens `path` as a raw, non-canonical serial device and applies
/// `config`. Returns the raw fd; ownership passes to the caller, which
/// typically wraps it in `bridge_core::io::CharDeviceIo`.
pub fn open(path: &str, config: &SerialConfig) -> io::Result<RawFd> {
    let c_path = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;

    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDWR | libc::O_NOCTTY | libc::O_NDELAY,
        )
    };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(err) = configure(fd, config) {
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    Ok(fd)
}

fn configure(fd: RawFd, config: &SerialConfig) -> io::Result<()> {
    unsafe {
        let mut termios: libc::termios = mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) < 0 {
            return Err(io::Error::last_os_error());
        }

        termios.c_cflag |= libc::CREAD | libc::CLOCAL;
        termios.c_cflag &= !libc::CSIZE;
        termios.c_cflag |= libc::CS8;

        match config.stopbits {
            StopBits::One => termios.c_cflag &= !libc::CSTOPB,
            StopBits::Two => termios.c_cflag |= libc::CSTOPB,
        }

        match config.parity {
            Parity::None => termios.c_cflag &= !libc::PARENB,
            Parity::Even => {
                termios.c_cflag |= libc::PARENB;
                termios.c_cflag &= !libc::PARODD;
            }
            Parity::Odd => {
                termios.c_cflag |= libc::PARENB;
                termios.c_cflag |= libc::PARODD;
            }
        }

        termios.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);

        if config.parity == Parity::None {
            termios.c_iflag &= !libc::INPCK;
        } else {
            termios.c_iflag |= libc::INPCK;
        }

        termios.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
        termios.c_oflag &= !libc::OPOST;

        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 0;

        let speed = closest_termios_speed(config.baudrate);
        libc::cfsetispeed(&mut termios, speed);
        libc::cfsetospeed(&mut termios, speed);

        if libc::tcsetattr(fd, libc::TCSANOW, &termios) < 0 {
            return Err(io::Error::last_os_error());
        }

        libc::tcflush(fd, libc::TCIOFLUSH);
    }

    Ok(())
}

/// Maps a requested baudrate onto the nearest standard `termios` speed
/// constant. The original extension always runs the line at a fixed
/// `B38400` and instead reprograms the UART's custom divisor via
/// `TIOCSSERIAL`; most RS-485 USB/TTL adapters in the field accept a
/// standard rate directly; the nonstandard-baud ioctl path is not
/// carried over here.
fn closest_termios_speed(baudrate: u32) -> libc::speed_t {
    const RATES: &[(u32, libc::speed_t)] = &[
        (9600, libc::B9600),
        (19200, libc::B19200),
        (38400, libc::B38400),
        (57600, libc::B57600),
        (115200, libc::B115200),
        (230400, libc::B230400),
    ];

    RATES
        .iter()
        .min_by_key(|(rate, _)| (*rate as i64 - baudrate as i64).abs())
        .map(|(_, speed)| *speed)
        .unwrap_or(libc::B115200)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closest_termios_speed_picks_exact_match() {
        assert_eq!(closest_termios_speed(115200), libc::B115200);
    }

    #[test]
    fn test_closest_termios_speed_rounds_to_nearest() {
        assert_eq!(closest_termios_speed(100000), libc::B115200);
    }

    #[test]
    fn test_open_nonexistent_device_errors() {
        let config = SerialConfig { baudrate: 115200, parity: Parity::None, stopbits: StopBits::One };
        assert!(open("/dev/does-not-exist-rs485", &config).is_err());
    }
}
