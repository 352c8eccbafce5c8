use std::process::Command;

/// Check whether `tc` is installed and we are root, i.e. whether qdiscs can
/// actually be installed on this host. Returns `false` if the environment
/// cannot support netem-based tests.
pub fn check_privileges() -> bool {
    let tc_ok = match Command::new("tc").args(["qdisc", "show"]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    };
    let is_root = Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false);
    tc_ok && is_root
}
