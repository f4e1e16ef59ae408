//! Serial port discovery and connection preference.
//!
//! Candidates are tried in this order:
//! 1. the explicitly configured port
//! 2. the port of the last successful connection
//! 3. every other enumerated port, with known-noisy platform UARTs
//!    (the Raspberry Pi console `/dev/ttyAMA0` by default) moved to the end

use tracing::{debug, warn};

/// Enumerate serial ports visible to the OS.
pub fn list_ports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!(error = %e, "Serial port enumeration failed");
            Vec::new()
        }
    }
}

/// Order connection candidates by preference, without duplicates.
pub fn order_candidates(
    configured: Option<&str>,
    last_used: Option<&str>,
    available: &[String],
    deprioritized: &[String],
) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(available.len() + 2);
    let mut push = |port: &str, ordered: &mut Vec<String>| {
        if !ordered.iter().any(|p| p == port) {
            ordered.push(port.to_string());
        }
    };

    if let Some(port) = configured {
        push(port, &mut ordered);
    }
    if let Some(port) = last_used.filter(|p| available.iter().any(|a| a == p)) {
        push(port, &mut ordered);
    }

    let (noisy, quiet): (Vec<&String>, Vec<&String>) = available
        .iter()
        .partition(|p| deprioritized.iter().any(|d| d == *p));
    for port in quiet.into_iter().chain(noisy) {
        push(port, &mut ordered);
    }

    debug!(candidates = ?ordered, "Port preference order");
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    #[traced_test]
    fn configured_then_last_then_rest() {
        let available = ports(&["/dev/ttyAMA0", "/dev/ttyUSB0", "/dev/ttyACM0"]);
        let order = order_candidates(
            Some("/dev/ttyS9"),
            Some("/dev/ttyACM0"),
            &available,
            &ports(&["/dev/ttyAMA0"]),
        );
        assert_eq!(
            order,
            ports(&["/dev/ttyS9", "/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyAMA0"])
        );
        assert!(logs_contain("Port preference order"));
    }

    #[test]
    fn stale_last_port_is_skipped() {
        let available = ports(&["/dev/ttyUSB1"]);
        let order = order_candidates(None, Some("/dev/ttyUSB0"), &available, &[]);
        assert_eq!(order, ports(&["/dev/ttyUSB1"]));
    }

    #[test]
    fn noisy_port_still_tried_when_alone() {
        let available = ports(&["/dev/ttyAMA0"]);
        let order = order_candidates(None, None, &available, &ports(&["/dev/ttyAMA0"]));
        assert_eq!(order, ports(&["/dev/ttyAMA0"]));
    }

    #[test]
    fn no_ports_no_candidates() {
        assert!(order_candidates(None, None, &[], &[]).is_empty());
    }
}
