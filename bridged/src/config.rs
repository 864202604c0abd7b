//! Typed view over the daemon's persisted settings file. Grounded on
//! `daemonlib/config.c`'s named-key accessors layered on top of
//! `conf_file.c`; here layered on `support::config::ConfFile`.

use std::net::IpAddr;
use std::path::Path;

use support::config::ConfFile;
use support::logging::Destination;

pub struct DaemonConfig {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub listen_dual_stack: bool,
    pub authentication_secret: Option<Vec<u8>>,
    pub log_level: String,
    pub log_destination: Destination,
    pub log_file_path: Option<String>,
    pub pid_file_path: String,
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
    pub rs485_device: Option<String>,
    pub rs485_baudrate: u32,
    pub rs485_slaves: Vec<u8>,
    pub rs485_crc_error_count_path: String,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            listen_address: "0.0.0.0".parse().unwrap(),
            listen_port: 4223,
            listen_dual_stack: false,
            authentication_secret: None,
            log_level: "info".to_string(),
            log_destination: Destination::Stderr,
            log_file_path: None,
            pid_file_path: "/var/run/bridged.pid".to_string(),
            usb_vendor_id: usb_stack::BRICK_VENDOR_ID,
            usb_product_id: usb_stack::BRICK_PRODUCT_ID,
            rs485_device: None,
            rs485_baudrate: 115200,
            rs485_slaves: Vec::new(),
            rs485_crc_error_count_path: "/tmp/extension_rs485_crc_error_count.conf".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<DaemonConfig> {
        let conf = ConfFile::read(path)?;
        let mut config = DaemonConfig::default();

        if let Some(value) = conf.get("listen.address") {
            if let Ok(addr) = value.parse() {
                config.listen_address = addr;
            }
        }
        if let Some(value) = conf.get("listen.port") {
            if let Ok(port) = value.parse() {
                config.listen_port = port;
            }
        }
        if let Some(value) = conf.get("listen.dual_stack") {
            config.listen_dual_stack = value == "true" || value == "1";
        }
        if let Some(value) = conf.get("authentication.secret") {
            if !value.is_empty() {
                config.authentication_secret = Some(value.as_bytes().to_vec());
            }
        }
        if let Some(value) = conf.get("log.level") {
            config.log_level = value.to_string();
        }
        if let Some(value) = conf.get("log.destination") {
            if value == "file" {
                config.log_destination = Destination::File;
            }
        }
        if let Some(value) = conf.get("log.file_path") {
            config.log_file_path = Some(value.to_string());
        }
        if let Some(value) = conf.get("pid_file") {
            config.pid_file_path = value.to_string();
        }
        if let Some(value) = conf.get("usb.vendor_id") {
            if let Ok(v) = u16::from_str_radix(value.trim_start_matches("0x"), 16) {
                config.usb_vendor_id = v;
            }
        }
        if let Some(value) = conf.get("usb.product_id") {
            if let Ok(v) = u16::from_str_radix(value.trim_start_matches("0x"), 16) {
                config.usb_product_id = v;
            }
        }
        if let Some(value) = conf.get("rs485.device") {
            config.rs485_device = Some(value.to_string());
        }
        if let Some(value) = conf.get("rs485.baudrate") {
            if let Ok(rate) = value.parse() {
                config.rs485_baudrate = rate;
            }
        }
        if let Some(value) = conf.get("rs485.slaves") {
            config.rs485_slaves = value
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Some(value) = conf.get("rs485.crc_error_count_path") {
            config.rs485_crc_error_count_path = value.to_string();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let config = DaemonConfig::load("/nonexistent/bridged.conf").unwrap();
        assert_eq!(config.listen_port, 4223);
        assert!(config.authentication_secret.is_none());
    }

    #[test]
    fn test_load_parses_known_keys() {
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            "listen.port=4224\nauthentication.secret=s3cret\nrs485.slaves=1,2,3\n",
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_port, 4224);
        assert_eq!(config.authentication_secret, Some(b"s3cret".to_vec()));
        assert_eq!(config.rs485_slaves, vec![1, 2, 3]);
    }
}
