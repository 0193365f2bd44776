use crate::error::{OverseerError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(OverseerError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Every spawned instance leads its own group. A group that is already gone
/// is not an error.
pub fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    let group = Pid::from_raw(-(pid as i32));
    match signal::kill(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => signal::kill(Pid::from_raw(pid as i32), signal)
            .or_else(|e| if e == Errno::ESRCH { Ok(()) } else { Err(e) })
            .map_err(|e| OverseerError::SignalError(format!("Failed to send {} to {}: {}", signal, pid, e))),
        Err(e) => Err(OverseerError::SignalError(format!(
            "Failed to send {} to group {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
        assert!(matches!(
            parse_signal("TERM"),
            Err(OverseerError::SignalError(_))
        ));
    }

    #[test]
    fn test_signal_missing_group_is_ok() {
        // Far above any default pid_max
        assert!(signal_group(999_999_999 / 2, Signal::SIGTERM).is_ok());
    }
}
