//! # Java runtime discovery.
//!
//! Scans the platform's conventional installation roots plus the supervisor's
//! own `runtimes/` directory, invokes each candidate with `-version`, and
//! parses the first quoted `version "X.Y.Z"` token from the banner (Java
//! prints it on standard error). Both version schemes are handled:
//!
//! ```text
//! openjdk version "17.0.1" 2021-10-19      → major 17
//! java version "1.8.0_291"                 → major 8
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use super::paths;

/// Seconds allowed for a `-version` probe before the candidate is skipped.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One discovered Java installation.
#[derive(Debug, Clone, Serialize)]
pub struct JavaRuntime {
    /// Absolute path of the `java` executable.
    pub path: PathBuf,
    /// Full version string as printed, e.g. `17.0.1`.
    pub version: String,
    /// Major version (8, 11, 17, 21, ...).
    pub major_version: u32,
    /// Vendor guessed from the banner.
    pub vendor: String,
    /// True when a `javac` sits next to the runtime (full development kit).
    pub is_development_kit: bool,
}

/// Scans known locations and returns working runtimes, newest major first.
pub async fn discover_runtimes(data_root: &Path) -> Vec<JavaRuntime> {
    let mut found: Vec<JavaRuntime> = Vec::new();
    let mut seen: Vec<PathBuf> = Vec::new();

    for candidate in candidate_executables(data_root) {
        let resolved = match candidate.canonicalize() {
            Ok(p) => p,
            Err(_) => continue,
        };
        if seen.contains(&resolved) {
            continue;
        }
        seen.push(resolved.clone());
        if let Some(runtime) = probe_runtime(&resolved).await {
            found.push(runtime);
        }
    }

    found.sort_by(|a, b| b.major_version.cmp(&a.major_version));
    found
}

/// Runs `java -version` on one executable and parses the banner.
pub async fn probe_runtime(java: &Path) -> Option<JavaRuntime> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(java).arg("-version").output(),
    )
    .await
    .ok()?
    .ok()?;

    // The banner goes to stderr; some distributions use stdout.
    let banner = if output.stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        String::from_utf8_lossy(&output.stderr).into_owned()
    };

    let version = parse_banner_version(&banner)?;
    let major_version = parse_major(&version)?;
    let vendor = guess_vendor(&banner);
    let is_development_kit = java
        .parent()
        .map(|bin| bin.join(javac_name()).is_file())
        .unwrap_or(false);

    debug!(java = %java.display(), %version, major_version, "probed java runtime");
    Some(JavaRuntime {
        path: java.to_path_buf(),
        version,
        major_version,
        vendor,
        is_development_kit,
    })
}

/// Extracts the first quoted token after `version` from the banner.
fn parse_banner_version(banner: &str) -> Option<String> {
    let first_line = banner.lines().next()?;
    let start = first_line.find('"')? + 1;
    let rest = &first_line[start..];
    let end = rest.find('"')?;
    let token = &rest[..end];
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Major version from either the modern (`17.0.1`) or legacy (`1.8.0_291`)
/// scheme.
fn parse_major(version: &str) -> Option<u32> {
    let mut parts = version.split(['.', '_', '+']);
    let first: u32 = parts.next()?.parse().ok()?;
    if first == 1 {
        parts.next()?.parse().ok()
    } else {
        Some(first)
    }
}

fn guess_vendor(banner: &str) -> String {
    let lower = banner.to_ascii_lowercase();
    if lower.contains("temurin") || lower.contains("adoptium") {
        "Eclipse Temurin"
    } else if lower.contains("corretto") {
        "Amazon Corretto"
    } else if lower.contains("zulu") {
        "Azul Zulu"
    } else if lower.contains("graalvm") {
        "GraalVM"
    } else if lower.contains("openjdk") {
        "OpenJDK"
    } else if lower.contains("hotspot") || lower.contains("java(tm)") {
        "Oracle"
    } else {
        "Unknown"
    }
    .to_string()
}

fn java_name() -> &'static str {
    if cfg!(windows) {
        "java.exe"
    } else {
        "java"
    }
}

fn javac_name() -> &'static str {
    if cfg!(windows) {
        "javac.exe"
    } else {
        "javac"
    }
}

/// Candidate `java` executables: PATH first, then system roots, then the
/// supervisor's own runtimes directory.
fn candidate_executables(data_root: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let exe = dir.join(java_name());
            if exe.is_file() {
                candidates.push(exe);
                break;
            }
        }
    }

    if let Some(home) = std::env::var_os("JAVA_HOME") {
        candidates.push(PathBuf::from(home).join("bin").join(java_name()));
    }

    for root in system_roots() {
        push_children(&mut candidates, &root);
    }

    push_children(&mut candidates, &paths::runtimes_dir(data_root));

    candidates.retain(|p| p.is_file());
    candidates
}

/// For each subdirectory of `root`, adds `<sub>/bin/java` and
/// `<sub>/Contents/Home/bin/java` (the macOS bundle layout).
fn push_children(out: &mut Vec<PathBuf>, root: &Path) {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        out.push(dir.join("bin").join(java_name()));
        out.push(
            dir.join("Contents")
                .join("Home")
                .join("bin")
                .join(java_name()),
        );
    }
}

#[cfg(target_os = "linux")]
fn system_roots() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/lib/jvm"),
        PathBuf::from("/opt/java"),
        PathBuf::from("/opt/jdk"),
    ]
}

#[cfg(target_os = "macos")]
fn system_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/Library/Java/JavaVirtualMachines")]
}

#[cfg(windows)]
fn system_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(pf) = std::env::var_os("ProgramFiles") {
        let pf = PathBuf::from(pf);
        for vendor in ["Java", "Eclipse Adoptium", "Temurin", "Microsoft"] {
            roots.push(pf.join(vendor));
        }
    }
    roots
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
fn system_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/lib/jvm")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_banner() {
        let banner = "openjdk version \"17.0.1\" 2021-10-19\nOpenJDK Runtime Environment";
        assert_eq!(parse_banner_version(banner).as_deref(), Some("17.0.1"));
        assert_eq!(parse_major("17.0.1"), Some(17));
    }

    #[test]
    fn parses_legacy_banner() {
        let banner = "java version \"1.8.0_291\"\nJava(TM) SE Runtime Environment";
        assert_eq!(parse_banner_version(banner).as_deref(), Some("1.8.0_291"));
        assert_eq!(parse_major("1.8.0_291"), Some(8));
    }

    #[test]
    fn rejects_bannerless_output() {
        assert_eq!(parse_banner_version("no quotes here"), None);
        assert_eq!(parse_banner_version(""), None);
    }

    #[test]
    fn vendor_guessing() {
        assert_eq!(
            guess_vendor("openjdk version \"21\" Temurin-21+35"),
            "Eclipse Temurin"
        );
        assert_eq!(guess_vendor("openjdk version \"17.0.1\""), "OpenJDK");
        assert_eq!(guess_vendor("something exotic"), "Unknown");
    }
}
