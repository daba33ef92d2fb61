//! Shell resolution and command wrapping.
//!
//! Resolution walks a fixed precedence ladder and records every attempt so
//! a surprising binary choice can be diagnosed from the result. Wrapping
//! prepends the progress-suppression and strict-mode directives plus the
//! internal self-destruct timer, and appends the metrics sentinel when
//! process sampling is on.

use std::path::{Path, PathBuf};

/// Marker prefixing the per-execution process sample smuggled out as the
/// final stdout line. Stripped before results are returned.
pub const METRICS_SENTINEL: &str = "__MCP_PSMETRICS__";

/// Milliseconds of lead the internal self-destruct keeps ahead of the
/// external deadline.
pub const SELF_DESTRUCT_LEAD_MS: u64 = 300;

/// Exit code the self-destruct timer uses; treated as a timeout by the
/// finalization gate.
pub const SELF_DESTRUCT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    /// pwsh / powershell: full wrapping support.
    PowerShell,
    /// Anything invoked as `<shell> -c <command>`: external timers only.
    Posix,
}

#[derive(Debug, Clone)]
pub struct ResolvedShell {
    pub program: PathBuf,
    pub flavor: ShellFlavor,
    /// Human-readable resolution trail, recorded on results.
    pub attempts: Vec<String>,
}

fn flavor_of(program: &Path) -> ShellFlavor {
    let stem = program
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if stem.contains("pwsh") || stem.contains("powershell") {
        ShellFlavor::PowerShell
    } else {
        ShellFlavor::Posix
    }
}

const KNOWN_INSTALL_PATHS: &[&str] = &[
    "/usr/bin/pwsh",
    "/usr/local/bin/pwsh",
    "/opt/microsoft/powershell/7/pwsh",
    r"C:\Program Files\PowerShell\7\pwsh.exe",
    r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
];

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Choose the shell binary. Precedence: explicit configuration override,
/// `SHELLGATE_POWERSHELL_PATH` from the environment, known install
/// locations, modern `pwsh` on PATH, legacy `powershell` on PATH, then the
/// bare fallback name (resolution is then left to the OS at spawn time).
pub fn resolve_shell(config_override: Option<&str>) -> ResolvedShell {
    let mut attempts = Vec::new();

    if let Some(overridden) = config_override {
        attempts.push(format!("config override: {overridden}"));
        let program = PathBuf::from(overridden);
        return ResolvedShell {
            flavor: flavor_of(&program),
            program,
            attempts,
        };
    }
    attempts.push("config override: unset".to_string());

    match std::env::var("SHELLGATE_POWERSHELL_PATH") {
        Ok(p) if !p.trim().is_empty() => {
            attempts.push(format!("env SHELLGATE_POWERSHELL_PATH: {p}"));
            let program = PathBuf::from(p);
            return ResolvedShell {
                flavor: flavor_of(&program),
                program,
                attempts,
            };
        }
        _ => attempts.push("env SHELLGATE_POWERSHELL_PATH: unset".to_string()),
    }

    for known in KNOWN_INSTALL_PATHS {
        if Path::new(known).is_file() {
            attempts.push(format!("known install path: {known}"));
            let program = PathBuf::from(known);
            return ResolvedShell {
                flavor: flavor_of(&program),
                program,
                attempts,
            };
        }
    }
    attempts.push("known install paths: none present".to_string());

    if let Some(found) = find_on_path("pwsh") {
        attempts.push(format!("PATH search pwsh: {}", found.display()));
        return ResolvedShell {
            program: found,
            flavor: ShellFlavor::PowerShell,
            attempts,
        };
    }
    attempts.push("PATH search pwsh: not found".to_string());

    if let Some(found) = find_on_path("powershell") {
        attempts.push(format!("PATH search powershell: {}", found.display()));
        return ResolvedShell {
            program: found,
            flavor: ShellFlavor::PowerShell,
            attempts,
        };
    }
    attempts.push("PATH search powershell: not found".to_string());

    attempts.push("fallback: pwsh".to_string());
    ResolvedShell {
        program: PathBuf::from("pwsh"),
        flavor: ShellFlavor::PowerShell,
        attempts,
    }
}

/// Options governing the wrapped script.
#[derive(Debug, Clone, Copy)]
pub struct WrapOptions {
    pub effective_timeout_ms: u64,
    pub self_destruct: bool,
    pub capture_process_metrics: bool,
}

/// Build the argument vector for the resolved shell.
pub fn shell_args(flavor: ShellFlavor, command: &str, opts: WrapOptions) -> Vec<String> {
    match flavor {
        ShellFlavor::PowerShell => vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            wrap_powershell(command, opts),
        ],
        ShellFlavor::Posix => vec!["-c".to_string(), command.to_string()],
    }
}

fn wrap_powershell(command: &str, opts: WrapOptions) -> String {
    let mut script = String::new();
    script.push_str("$ProgressPreference = 'SilentlyContinue'\n");
    script.push_str("Set-StrictMode -Version Latest\n");

    if opts.self_destruct {
        let fire_at = opts
            .effective_timeout_ms
            .saturating_sub(SELF_DESTRUCT_LEAD_MS)
            .max(1);
        script.push_str(&format!(
            "$__sdTimer = New-Object System.Timers.Timer({fire_at})\n\
             $__sdTimer.AutoReset = $false\n\
             $null = Register-ObjectEvent -InputObject $__sdTimer -EventName Elapsed -Action {{ [Environment]::Exit({SELF_DESTRUCT_EXIT_CODE}) }}\n\
             $__sdTimer.Start()\n",
        ));
    }

    script.push_str(command);
    script.push('\n');

    if opts.capture_process_metrics {
        script.push_str(&format!(
            "$__proc = Get-Process -Id $PID\n\
             Write-Output (\"{METRICS_SENTINEL}{{0}},{{1}}\" -f [math]::Round($__proc.TotalProcessorTime.TotalSeconds, 3), [math]::Round($__proc.WorkingSet64 / 1MB, 2))\n",
        ));
    }

    script
}

/// Search the tail of stdout for the sentinel line; strip it and parse the
/// sample. Parse failures discard the sample silently, the sentinel is not
/// part of the user contract.
pub fn extract_sentinel(stdout: &str) -> (String, Option<(f64, f64)>) {
    let trimmed_end = stdout.trim_end_matches(['\r', '\n']);
    let idx = trimmed_end.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let last_line = trimmed_end[idx..].trim();
    if !last_line.starts_with(METRICS_SENTINEL) {
        return (stdout.to_string(), None);
    }

    let remainder = trimmed_end[..idx].trim_end_matches(['\r', '\n']).to_string();
    let payload = &last_line[METRICS_SENTINEL.len()..];
    let mut parts = payload.splitn(2, ',');
    let sample = match (
        parts.next().and_then(|v| v.trim().parse::<f64>().ok()),
        parts.next().and_then(|v| v.trim().parse::<f64>().ok()),
    ) {
        (Some(cpu), Some(ws)) => Some((cpu, ws)),
        _ => None,
    };
    (remainder, sample)
}
