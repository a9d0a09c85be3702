//! Queries against the Proxmox host: guest inventory, running dump or
//! restore processes, and the live status shown on the status page.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::models::artifact::GuestKind;
use crate::remote::{Connector, RemoteError, RemoteSession, SshTarget};

/// Process-list lines for `tool`. The bracket keeps grep from matching itself.
pub fn running_processes(session: &mut dyn RemoteSession, tool: &str) -> Result<Vec<String>, RemoteError> {
    let mut chars = tool.chars();
    let pattern = match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str()),
        None => return Ok(Vec::new()),
    };
    let result = session.run(&format!("ps aux | grep '{pattern}'"))?;
    Ok(result
        .stdout
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// VMIDs from `qm list` / `pct list` output; header and junk lines are skipped.
pub fn parse_guest_list(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Every VM and container on the host, ordered by VMID.
pub fn list_guests(session: &mut dyn RemoteSession) -> Result<BTreeMap<u64, (String, GuestKind)>, RemoteError> {
    let mut guests = BTreeMap::new();
    for kind in [GuestKind::Vm, GuestKind::Container] {
        let result = session.run(&format!("{} list", kind.cli()))?;
        if !result.exit.success() {
            tracing::debug!(cli = kind.cli(), stderr = %result.exit.stderr, "Guest listing failed");
            continue;
        }
        for id in parse_guest_list(&result.stdout) {
            if let Ok(numeric) = id.parse::<u64>() {
                guests.entry(numeric).or_insert((id, kind));
            }
        }
    }
    Ok(guests)
}

/// Which kind of guest, if any, currently owns `vmid`.
pub fn find_guest(session: &mut dyn RemoteSession, vmid: &str) -> Result<Option<GuestKind>, RemoteError> {
    Ok(list_guests(session)?
        .into_values()
        .find(|(id, _)| id == vmid)
        .map(|(_, kind)| kind))
}

/// One VM or container as `qm list` / `pct list` report it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestStatus {
    pub vmid: String,
    pub kind: GuestKind,
    pub name: Option<String>,
    pub status: String,
}

/// Used and total MiB of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub total_mib: u64,
    pub used_mib: u64,
    pub percent: f64,
}

impl ResourceUsage {
    fn new(total_mib: u64, used_mib: u64) -> Self {
        let percent = if total_mib == 0 {
            0.0
        } else {
            round2(used_mib as f64 / total_mib as f64 * 100.0)
        };
        Self {
            total_mib,
            used_mib,
            percent,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Guest table from `qm list` or `pct list`, columns located by header.
pub fn parse_guest_statuses(lines: &[String], kind: GuestKind) -> Vec<GuestStatus> {
    let mut rows = lines.iter().filter(|l| !l.trim().is_empty());
    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = header.split_whitespace().map(str::to_ascii_lowercase).collect();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (status_col, name_col) = (column("status"), column("name"));

    rows.filter_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let vmid = *fields.first().filter(|id| id.chars().all(|c| c.is_ascii_digit()))?;
        // An empty Lock column shifts a trailing Name column left.
        let name = match name_col {
            Some(i) if i + 1 == headers.len() && fields.len() > 1 => fields.last(),
            Some(i) => fields.get(i),
            None => None,
        };
        Some(GuestStatus {
            vmid: vmid.to_string(),
            kind,
            name: name.map(|n| n.to_string()),
            status: status_col
                .and_then(|i| fields.get(i))
                .map(|s| s.to_string())
                .unwrap_or_default(),
        })
    })
    .collect()
}

fn cpu_idle_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*id").expect("valid cpu regex"))
}

/// Busy percentage from the `%Cpu(s)` line of `top -bn1`.
pub fn parse_cpu_usage(line: &str) -> Option<f64> {
    let idle: f64 = cpu_idle_pattern().captures(line)?[1].parse().ok()?;
    Some(round2(100.0 - idle))
}

/// 1, 5 and 15 minute load from `/proc/loadavg`.
pub fn parse_load_avg(line: &str) -> Option<[f64; 3]> {
    let mut fields = line.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

/// Memory and swap rows of `free -m`.
pub fn parse_free(lines: &[String]) -> (Option<ResourceUsage>, Option<ResourceUsage>) {
    let row = |prefix: &str| {
        lines.iter().find(|l| l.starts_with(prefix)).and_then(|l| {
            let fields: Vec<u64> = l.split_whitespace().skip(1).take(2).filter_map(|f| f.parse().ok()).collect();
            match fields[..] {
                [total, used] => Some(ResourceUsage::new(total, used)),
                _ => None,
            }
        })
    };
    (row("Mem:"), row("Swap:"))
}

/// Root filesystem row of `df -m /`.
pub fn parse_df(line: &str) -> Option<ResourceUsage> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    Some(ResourceUsage {
        total_mib: fields[1].parse().ok()?,
        used_mib: fields[2].parse().ok()?,
        percent: fields[4].trim_end_matches('%').parse().ok()?,
    })
}

/// First address of `hostname -I` that is not loopback.
pub fn first_routable_ip(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|ip| !ip.starts_with("127.") && *ip != "::1")
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStatus {
    pub online: bool,
    pub hostname: Option<String>,
    pub pve_version: Option<String>,
    pub kernel: Option<String>,
    pub ip: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_usage: Option<f64>,
    pub load_avg: Option<[f64; 3]>,
    pub memory: Option<ResourceUsage>,
    pub swap: Option<ResourceUsage>,
    pub disk: Option<ResourceUsage>,
    pub guests: Vec<GuestStatus>,
    pub dump_running: bool,
    pub restore_running: bool,
    pub processes: Vec<String>,
    pub error: Option<String>,
}

/// Stdout of a command that exited cleanly.
fn output_of(session: &mut dyn RemoteSession, command: &str) -> Option<Vec<String>> {
    session
        .run(command)
        .ok()
        .filter(|r| r.exit.success())
        .map(|r| r.stdout)
}

fn first_line(session: &mut dyn RemoteSession, command: &str) -> Option<String> {
    output_of(session, command)?
        .into_iter()
        .map(|l| l.trim().to_string())
        .find(|l| !l.is_empty())
}

/// Live look at the host. Never fails; problems land in `error`.
pub fn probe_host(connector: &dyn Connector, target: &SshTarget) -> HostStatus {
    let mut session = match connector.connect(target) {
        Ok(session) => session,
        Err(e) => {
            return HostStatus {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };
    let session = session.as_mut();

    let mut status = HostStatus {
        online: true,
        ..Default::default()
    };
    status.hostname = first_line(session, "hostname");
    status.pve_version = first_line(session, "pveversion");
    status.kernel = first_line(session, "uname -r");
    status.ip = first_line(session, "hostname -I").and_then(|l| first_routable_ip(&l));
    status.cpu_model = first_line(session, "lscpu | grep 'Model name'")
        .and_then(|l| l.split_once(':').map(|(_, model)| model.trim().to_string()));
    status.cpu_cores = first_line(session, "nproc").and_then(|l| l.parse().ok());
    status.cpu_usage = first_line(session, "top -bn1 | grep 'Cpu(s)'").and_then(|l| parse_cpu_usage(&l));
    status.load_avg = first_line(session, "cat /proc/loadavg").and_then(|l| parse_load_avg(&l));
    if let Some(lines) = output_of(session, "free -m") {
        (status.memory, status.swap) = parse_free(&lines);
    }
    status.disk = first_line(session, "df -m / | tail -1").and_then(|l| parse_df(&l));
    for kind in [GuestKind::Vm, GuestKind::Container] {
        if let Some(lines) = output_of(session, &format!("{} list", kind.cli())) {
            status.guests.extend(parse_guest_statuses(&lines, kind));
        }
    }

    let mut probe = |tool: &str| match running_processes(&mut *session, tool) {
        Ok(lines) => lines,
        Err(e) => {
            status.error.get_or_insert_with(|| e.to_string());
            Vec::new()
        }
    };
    let dumps = probe("vzdump");
    let restores: Vec<String> = probe("qmrestore")
        .into_iter()
        .chain(probe("pct restore"))
        .collect();

    status.dump_running = !dumps.is_empty();
    status.restore_running = !restores.is_empty();
    status.processes = dumps.into_iter().chain(restores).collect();
    status
}
